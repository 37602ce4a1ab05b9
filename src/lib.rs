//! Image Batch Converter Library
//!
//! Converts batches of uploaded images to one output format and packs the
//! results into a zip archive. Every file gets an outcome: files whose target
//! format is unknown or whose encoder rejects them are written as PNG
//! instead, and only unreadable inputs fail.

pub mod archiver;
pub mod batch;
pub mod catalog;
pub mod codecs;
pub mod config;
pub mod converter;
pub mod decoder;
pub mod image_processor;
pub mod normalizer;
pub mod progress;
pub mod types;

pub use archiver::Archiver;
pub use batch::{BatchOptions, CancellationToken};
pub use catalog::{EncoderId, EncoderSpec, FormatCatalog};
pub use config::{ParameterOverrides, ServiceConfig};
pub use converter::ImagesConverter;
pub use progress::{NoProgress, ProgressSink, ProgressTracker};
pub use types::*;
