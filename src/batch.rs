use crate::archiver::{archive_name, explicit_archive_name, Archiver, ARCHIVE_PROGRESS_START};
use crate::converter::ImagesConverter;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::types::*;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Converted files are written here, under the destination directory.
pub const OUTPUT_SUBDIR: &str = "out";

/// Shared flag checked between files. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Archive basename to use instead of the generated one.
    pub archive_name: Option<String>,
    /// Leave the loose converted files next to the archive.
    pub keep_outputs: bool,
    /// Worker threads; 0 or 1 converts sequentially.
    pub workers: usize,
    pub cancellation: Option<CancellationToken>,
}

impl BatchOptions {
    fn cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

impl ImagesConverter {
    /// Converts every input, then archives the successful outputs into
    /// `destination_dir`. Conversion reports progress in 0..=80 and
    /// archiving in 80..=100. Outcomes come back in input order.
    pub fn convert_batch(
        &self,
        inputs: Vec<InputFile>,
        target_extension: &str,
        destination_dir: &Path,
        options: &BatchOptions,
        progress: &dyn ProgressSink,
    ) -> BatchOutcome {
        if inputs.is_empty() {
            log::info!("Empty batch, nothing to convert");
            return BatchOutcome::empty();
        }

        let tracker = ProgressTracker::new(progress);
        let out_dir = destination_dir.join(OUTPUT_SUBDIR);
        if let Err(e) = fs::create_dir_all(&out_dir) {
            let reason = ConversionError::from(e).to_string();
            log::error!("Cannot create {}: {}", out_dir.display(), reason);
            return BatchOutcome {
                per_file_outcomes: inputs
                    .iter()
                    .map(|input| ConversionOutcome::failed(&input.original_name, reason.clone()))
                    .collect(),
                ..BatchOutcome::empty()
            };
        }

        log::info!("🚀 Converting {} files to {}", inputs.len(), target_extension);
        let outcomes = if options.workers > 1 {
            self.convert_parallel(inputs, target_extension, &out_dir, options, &tracker)
        } else {
            self.convert_sequential(inputs, target_extension, &out_dir, options, &tracker)
        };

        let outputs: Vec<PathBuf> = outcomes
            .iter()
            .filter(|o| o.succeeded)
            .filter_map(|o| o.output_path.clone())
            .collect();
        let mut outcome = BatchOutcome {
            succeeded: false,
            archive_path: None,
            converted_count: outcomes.iter().filter(|o| o.succeeded).count(),
            fallback_count: outcomes.iter().filter(|o| o.succeeded && o.used_fallback).count(),
            per_file_outcomes: outcomes,
        };
        log::info!(
            "Converted {}/{} files ({} via PNG fallback)",
            outcome.converted_count,
            outcome.per_file_outcomes.len(),
            outcome.fallback_count
        );
        if outputs.is_empty() {
            log::warn!("No file converted, skipping archive");
            return outcome;
        }

        tracker.report(ARCHIVE_PROGRESS_START, "Archiving…");
        let name = options
            .archive_name
            .as_deref()
            .and_then(explicit_archive_name)
            .unwrap_or_else(|| archive_name(&self.format_token(target_extension), &self.params().brand_tag, chrono::Utc::now()));

        match Archiver::default().archive(&outputs, destination_dir, &name, &tracker) {
            Ok(path) => {
                if !options.keep_outputs {
                    remove_outputs(&outputs);
                }
                log::info!("✅ Batch archived at {}", path.display());
                outcome.succeeded = true;
                outcome.archive_path = Some(path);
                tracker.report(100, "Done");
            }
            Err(e) => log::error!("❌ Batch failed: {}", e),
        }
        outcome
    }

    /// The requested extension, or "png" when the catalog does not know it.
    fn format_token(&self, target_extension: &str) -> String {
        match self.catalog().lookup(target_extension) {
            Some(spec) => spec.extension.to_string(),
            None => "png".to_string(),
        }
    }

    fn convert_sequential(
        &self,
        inputs: Vec<InputFile>,
        target_extension: &str,
        out_dir: &Path,
        options: &BatchOptions,
        tracker: &ProgressTracker<'_>,
    ) -> Vec<ConversionOutcome> {
        let total = inputs.len();
        let mut outcomes = Vec::with_capacity(total);
        for (index, input) in inputs.into_iter().enumerate() {
            if options.cancelled() {
                outcomes.push(ConversionOutcome::failed(&input.original_name, ConversionError::Cancelled.to_string()));
                continue;
            }
            let label = format!("Converting: {}", input.original_name);
            tracker.report_step(0, ARCHIVE_PROGRESS_START, index, total, &label);
            outcomes.push(self.convert_one(input, out_dir, target_extension));
        }
        outcomes
    }

    fn convert_parallel(
        &self,
        inputs: Vec<InputFile>,
        target_extension: &str,
        out_dir: &Path,
        options: &BatchOptions,
        tracker: &ProgressTracker<'_>,
    ) -> Vec<ConversionOutcome> {
        let pool = match rayon::ThreadPoolBuilder::new().num_threads(options.workers).build() {
            Ok(pool) => pool,
            Err(e) => {
                log::warn!("Could not start {} workers ({}), converting sequentially", options.workers, e);
                return self.convert_sequential(inputs, target_extension, out_dir, options, tracker);
            }
        };

        let total = inputs.len();
        let finished = AtomicUsize::new(0);
        pool.install(|| {
            inputs
                .into_par_iter()
                .map(|input| {
                    if options.cancelled() {
                        return ConversionOutcome::failed(&input.original_name, ConversionError::Cancelled.to_string());
                    }
                    let label = format!("Converting: {}", input.original_name);
                    let outcome = self.convert_one(input, out_dir, target_extension);
                    let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    tracker.report_step(0, ARCHIVE_PROGRESS_START, done, total, &label);
                    outcome
                })
                .collect()
        })
    }
}

fn remove_outputs(outputs: &[PathBuf]) {
    for path in outputs {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EncoderId;
    use crate::progress::NoProgress;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn png(seed: u8) -> Vec<u8> {
        let img = RgbImage::from_fn(6, 4, |x, y| Rgb([seed, x as u8 * 10, y as u8 * 10]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn inputs(count: usize) -> Vec<InputFile> {
        (0..count)
            .map(|i| InputFile::from_bytes(format!("img{i}.png"), png(i as u8)))
            .collect()
    }

    fn entry_names(path: &Path) -> HashSet<String> {
        let mut archive = ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn converter() -> ImagesConverter {
        ImagesConverter::new(EncodeParameters::default())
    }

    #[test]
    fn empty_batch_produces_nothing() {
        let dir = TempDir::new().unwrap();
        let outcome = converter().convert_batch(vec![], "png", dir.path(), &BatchOptions::default(), &NoProgress);
        assert!(!outcome.succeeded);
        assert!(outcome.archive_path.is_none());
        assert_eq!(outcome.converted_count, 0);
        assert!(outcome.per_file_outcomes.is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn corrupt_only_batch_fails_without_archive() {
        let dir = TempDir::new().unwrap();
        let outcome = converter().convert_batch(
            vec![InputFile::from_bytes("broken.dat", vec![0, 1, 2, 3])],
            "png",
            dir.path(),
            &BatchOptions::default(),
            &NoProgress,
        );
        assert!(!outcome.succeeded);
        assert!(outcome.archive_path.is_none());
        let failures = outcome.failure_reports();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].source, "broken.dat");
        assert_eq!(failures[0].reason, "unrecognized file");
    }

    #[test]
    fn unsupported_target_falls_back_for_every_file() {
        let dir = TempDir::new().unwrap();
        let outcome = converter().convert_batch(inputs(10), "xyz", dir.path(), &BatchOptions::default(), &NoProgress);

        assert!(outcome.succeeded);
        assert_eq!(outcome.converted_count, 10);
        assert_eq!(outcome.fallback_count, 10);
        for file in &outcome.per_file_outcomes {
            assert!(file.used_fallback);
            assert_eq!(file.output_encoder, Some(EncoderId::Png));
        }
        let archive = outcome.archive_path.unwrap();
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("images-png-converte-tudo-"), "{name}");
        assert_eq!(entry_names(&archive).len(), 10);
    }

    #[test]
    fn archive_matches_successful_outputs_and_loose_files_are_removed() {
        let dir = TempDir::new().unwrap();
        let mut batch = inputs(3);
        batch.insert(1, InputFile::from_bytes("junk.txt", b"hello".to_vec()));
        let outcome = converter().convert_batch(batch, "gif", dir.path(), &BatchOptions::default(), &NoProgress);

        assert!(outcome.succeeded);
        assert_eq!(outcome.converted_count, 3);
        assert_eq!(outcome.failures().count(), 1);
        let expected: HashSet<String> = outcome
            .per_file_outcomes
            .iter()
            .filter_map(|o| o.output_basename())
            .collect();
        assert_eq!(entry_names(outcome.archive_path.as_ref().unwrap()), expected);
        for file in outcome.per_file_outcomes.iter().filter_map(|o| o.output_path.as_ref()) {
            assert!(!file.exists());
        }
    }

    #[test]
    fn keep_outputs_retains_files_and_reruns_reuse_them() {
        let dir = TempDir::new().unwrap();
        let options = BatchOptions {
            keep_outputs: true,
            ..BatchOptions::default()
        };
        let first = converter().convert_batch(inputs(2), "bmp", dir.path(), &options, &NoProgress);
        assert!(first.succeeded);
        for file in &first.per_file_outcomes {
            assert!(file.output_path.as_ref().unwrap().exists());
        }

        let second = converter().convert_batch(inputs(2), "bmp", dir.path(), &options, &NoProgress);
        assert!(second.succeeded);
        for file in &second.per_file_outcomes {
            assert!(!file.used_fallback);
            assert_eq!(file.reason.as_deref(), Some(crate::converter::ALREADY_EXISTED));
        }
        assert_ne!(first.archive_path, second.archive_path);
    }

    #[test]
    fn parallel_workers_keep_input_order() {
        let dir = TempDir::new().unwrap();
        let mut batch = inputs(8);
        batch.insert(3, InputFile::from_bytes("bad.bin", vec![9; 32]));
        let names: Vec<String> = batch.iter().map(|i| i.original_name.clone()).collect();
        let options = BatchOptions {
            workers: 4,
            ..BatchOptions::default()
        };

        let seen = Mutex::new(Vec::new());
        let sink = |p: u8, _: &str| seen.lock().unwrap().push(p);
        let outcome = converter().convert_batch(batch, "tiff", dir.path(), &options, &sink);

        let order: Vec<String> = outcome.per_file_outcomes.iter().map(|o| o.source_name.clone()).collect();
        assert_eq!(order, names);
        assert!(!outcome.per_file_outcomes[3].succeeded);
        assert_eq!(outcome.converted_count, 8);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn sequential_progress_stays_below_archive_range_while_converting() {
        let dir = TempDir::new().unwrap();
        let seen = Mutex::new(Vec::new());
        let sink = |p: u8, label: &str| seen.lock().unwrap().push((p, label.to_string()));
        converter().convert_batch(inputs(4), "png", dir.path(), &BatchOptions::default(), &sink);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (0, "Converting: img0.png".to_string()));
        assert_eq!(seen[3], (60, "Converting: img3.png".to_string()));
        assert_eq!(seen[4], (80, "Archiving…".to_string()));
        assert_eq!(seen.last().unwrap().0, 100);
    }

    #[test]
    fn cancellation_marks_unstarted_files() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        let options = BatchOptions {
            cancellation: Some(token.clone()),
            ..BatchOptions::default()
        };
        let sink = |_: u8, label: &str| {
            if label == "Converting: img1.png" {
                token.cancel();
            }
        };
        let outcome = converter().convert_batch(inputs(3), "png", dir.path(), &options, &sink);

        assert!(outcome.per_file_outcomes[0].succeeded);
        assert!(outcome.per_file_outcomes[1].succeeded);
        assert!(!outcome.per_file_outcomes[2].succeeded);
        assert_eq!(outcome.per_file_outcomes[2].reason.as_deref(), Some("cancelled"));
        assert!(outcome.succeeded);
    }

    #[test]
    fn cancelled_before_start_converts_nothing() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let options = BatchOptions {
            cancellation: Some(token),
            workers: 2,
            ..BatchOptions::default()
        };
        let outcome = converter().convert_batch(inputs(3), "png", dir.path(), &options, &NoProgress);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.per_file_outcomes.len(), 3);
        assert!(outcome.failures().all(|o| o.reason.as_deref() == Some("cancelled")));
    }

    #[test]
    fn explicit_archive_name_is_used() {
        let dir = TempDir::new().unwrap();
        let options = BatchOptions {
            archive_name: Some("my batch".into()),
            ..BatchOptions::default()
        };
        let outcome = converter().convert_batch(inputs(1), "webp", dir.path(), &options, &NoProgress);
        assert_eq!(outcome.archive_path, Some(dir.path().join("my batch.zip")));
    }
}
