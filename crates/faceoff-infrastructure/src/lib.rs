//! Infrastructure services for Faceoff.
//!
//! Currently this crate holds the export side: pure renderers that turn a
//! [`faceoff_core::ComparisonSession`] snapshot into JSON and Markdown
//! artifacts, plus the file writer that places them on disk.

pub mod export;

pub use export::{ComparisonExport, ResponseExport};
