use crate::converter::slugify;
use crate::progress::ProgressTracker;
use crate::types::ConversionError;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use zip::result::ZipResult;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const ARCHIVE_PROGRESS_START: u8 = 80;
const DEFAULT_LEVEL: i32 = 6;

/// Packs converted files into one deflate-compressed zip archive.
#[derive(Debug, Clone, Copy)]
pub struct Archiver {
    compression_level: i32,
}

impl Default for Archiver {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_LEVEL,
        }
    }
}

impl Archiver {
    pub fn with_level(level: i32) -> Self {
        Self {
            compression_level: level.clamp(0, 9),
        }
    }

    /// Writes `outputs` into `destination_dir/archive_name` (suffixed when
    /// that name is taken) and returns the archive's path. Entries are named
    /// by basename; a basename seen twice is stored once. A failed archive is
    /// removed before the error is returned.
    pub fn archive(
        &self,
        outputs: &[PathBuf],
        destination_dir: &Path,
        archive_name: &str,
        progress: &ProgressTracker<'_>,
    ) -> Result<PathBuf, ConversionError> {
        fs::create_dir_all(destination_dir).map_err(archive_error)?;
        let path = unique_path(destination_dir, archive_name);
        log::info!("Archiving {} files into {}", outputs.len(), path.display());

        if let Err(e) = self.write_entries(&path, outputs, progress) {
            log::error!("Failed to write archive {}: {}", path.display(), e);
            if let Err(cleanup) = fs::remove_file(&path) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    log::warn!("Could not remove partial archive {}: {}", path.display(), cleanup);
                }
            }
            return Err(archive_error(e));
        }
        Ok(path)
    }

    fn write_entries(&self, path: &Path, outputs: &[PathBuf], progress: &ProgressTracker<'_>) -> ZipResult<()> {
        let mut zip = ZipWriter::new(BufWriter::new(File::create(path)?));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.compression_level));

        let mut seen = HashSet::new();
        let total = outputs.len();
        for (index, output) in outputs.iter().enumerate() {
            let Some(name) = output.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if seen.insert(name.clone()) {
                zip.start_file(name.as_str(), options)?;
                let mut source = File::open(output)?;
                io::copy(&mut source, &mut zip)?;
                log::info!("📦 Archived {}", name);
            } else {
                log::debug!("Skipping duplicate archive entry {}", name);
            }
            progress.report_step(ARCHIVE_PROGRESS_START, 100, index + 1, total, &format!("Archiving: {name}"));
        }

        zip.finish()?.flush()?;
        Ok(())
    }
}

fn archive_error(err: impl std::fmt::Display) -> ConversionError {
    ConversionError::ArchiveWrite {
        message: err.to_string(),
    }
}

/// `images-<format>-<brand>-<YYYYMMDDTHHMMSS>.zip`, leaving out the brand
/// when it slugifies to nothing.
pub fn archive_name(format_token: &str, brand_tag: &str, timestamp: DateTime<Utc>) -> String {
    let format = match slugify(format_token) {
        token if token.is_empty() => "png".to_string(),
        token => token,
    };
    let stamp = timestamp.format("%Y%m%dT%H%M%S");
    match slugify(brand_tag) {
        brand if brand.is_empty() => format!("images-{format}-{stamp}.zip"),
        brand => format!("images-{format}-{brand}-{stamp}.zip"),
    }
}

/// Turns a caller-supplied archive name into a safe basename ending in `.zip`.
pub fn explicit_archive_name(requested: &str) -> Option<String> {
    let base = crate::converter::sanitize_filename(requested.trim());
    let base = base.trim_start_matches('.');
    if base.is_empty() {
        return None;
    }
    if base.to_ascii_lowercase().ends_with(".zip") {
        Some(base.to_string())
    } else {
        Some(format!("{base}.zip"))
    }
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (name, String::new()),
    };
    (1..)
        .map(|n| dir.join(format!("{stem}-{n}{ext}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
