use std::sync::Mutex;

/// Receives `(percent, label)` notifications while a batch runs.
pub trait ProgressSink: Sync {
    fn report(&self, percent: u8, label: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(u8, &str) + Sync,
{
    fn report(&self, percent: u8, label: &str) {
        self(percent, label)
    }
}

/// Sink that drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: u8, _label: &str) {}
}

/// Funnels reports from any number of workers into one sink, never letting
/// the percentage go backwards and capping it at 100.
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    last: Mutex<u8>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            last: Mutex::new(0),
        }
    }

    pub fn report(&self, percent: u8, label: &str) {
        // poisoned only if a sink panicked mid-report
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let percent = percent.min(100).max(*last);
        *last = percent;
        self.sink.report(percent, label);
    }

    /// Reports `done` of `total` mapped linearly onto `start..=end`.
    pub fn report_step(&self, start: u8, end: u8, done: usize, total: usize, label: &str) {
        let span = end.saturating_sub(start) as usize;
        let offset = if total == 0 { span } else { done.min(total) * span / total };
        self.report(start + offset as u8, label);
    }

    pub fn last(&self) -> u8 {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProgressSink for ProgressTracker<'_> {
    fn report(&self, percent: u8, label: &str) {
        ProgressTracker::report(self, percent, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_sinks() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: u8, label: &str| seen.lock().unwrap().push((p, label.to_string()));
        sink.report(5, "a");
        assert_eq!(seen.lock().unwrap().as_slice(), &[(5, "a".to_string())]);
    }

    #[test]
    fn tracker_is_monotonic_and_capped() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: u8, _: &str| seen.lock().unwrap().push(p);
        let tracker = ProgressTracker::new(&sink);
        for p in [10, 40, 20, 80, 200] {
            tracker.report(p, "x");
        }
        assert_eq!(*seen.lock().unwrap(), vec![10, 40, 40, 80, 100]);
        assert_eq!(tracker.last(), 100);
    }

    #[test]
    fn steps_map_onto_a_range() {
        let seen = Mutex::new(Vec::new());
        let sink = |p: u8, _: &str| seen.lock().unwrap().push(p);
        let tracker = ProgressTracker::new(&sink);
        tracker.report_step(0, 80, 1, 4, "a");
        tracker.report_step(0, 80, 3, 4, "b");
        tracker.report_step(80, 100, 1, 2, "c");
        tracker.report_step(80, 100, 0, 0, "d");
        assert_eq!(*seen.lock().unwrap(), vec![20, 60, 90, 100]);
    }
}
