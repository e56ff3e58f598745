//! Feed access: gzipped, unheadered CSV files in a data directory.
//!
//! The remote object-store fetch that produces these files is an external
//! collaborator; this module only knows how to open them from a local path.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::{CatalogError, CatalogResult};

/// Feed file names as published by the upstream exporter.
pub const LIBRARIES_FEED: &str = "libraries.csv.gz";
pub const MEDIA_FEED: &str = "media.csv.gz";
pub const AVAILABILITY_FEED: &str = "availability.csv.gz";

/// A directory containing the three catalog feeds.
#[derive(Debug, Clone)]
pub struct FeedDir {
    root: PathBuf,
}

impl FeedDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open a feed as a decompressing reader.
    pub fn open(&self, name: &str) -> CatalogResult<impl Read> {
        let path = self.root.join(name);
        let file = File::open(&path).map_err(|e| CatalogError::Feed {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(GzDecoder::new(file))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// CSV reader over a feed stream: no headers, tolerant of ragged rows
/// (short rows are logged and skipped by the per-feed loaders).
pub fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader)
}
