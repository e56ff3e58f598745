//! Startup orchestration: feeds in, index built, gate opened.
//!
//! Load order matters: libraries first (availability rows reference their
//! ordinals), then media, then availability, then the index build over the
//! persisted `mk` rows. A warm store (size above the threshold) skips the
//! CSV passes but always recovers the format dictionary and always rebuilds
//! the in-memory index.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::catalog::availability::{load_availability, FormatTable};
use crate::catalog::feed::{FeedDir, AVAILABILITY_FEED, LIBRARIES_FEED, MEDIA_FEED};
use crate::catalog::library::{load_libraries, LibraryRegistry};
use crate::catalog::media::{self, load_media};
use crate::error::{CatalogError, DeepResult};
use crate::index::SearchIndex;
use crate::store::{keys, Kv};

/// Records decoded per index-build batch handed to the rayon pool.
const INDEX_BATCH: usize = 1024;

/// Phases of the load pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadPhase {
    Libraries = 0,
    Media = 1,
    Availability = 2,
    Indexing = 3,
    Ready = 4,
}

impl LoadPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Libraries,
            1 => Self::Media,
            2 => Self::Availability,
            3 => Self::Indexing,
            _ => Self::Ready,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Libraries => "libraries feed",
            Self::Media => "media feed",
            Self::Availability => "availability feed",
            Self::Indexing => "index build",
            Self::Ready => "ready",
        }
    }

    /// Coarse completion percentage at the start of this phase.
    fn percent(self) -> u8 {
        match self {
            Self::Libraries => 2,
            Self::Media => 10,
            Self::Availability => 55,
            Self::Indexing => 80,
            Self::Ready => 100,
        }
    }
}

/// Shared load state: gates the API until the index is finalized.
#[derive(Debug)]
pub struct LoadProgress {
    phase: AtomicU8,
    rows: AtomicU64,
}

impl LoadProgress {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(LoadPhase::Libraries as u8),
            rows: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> LoadPhase {
        LoadPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: LoadPhase) {
        self.rows.store(0, Ordering::Relaxed);
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Row counter for the current phase.
    pub fn rows(&self) -> &AtomicU64 {
        &self.rows
    }

    /// Whether the service can answer queries.
    pub fn is_ready(&self) -> bool {
        self.phase() == LoadPhase::Ready
    }

    /// Human-readable progress line for the 503 response.
    pub fn describe(&self) -> String {
        let phase = self.phase();
        if phase == LoadPhase::Ready {
            return "ready".to_string();
        }
        format!(
            "loading: {}% ({}, {} rows)",
            phase.percent(),
            phase.label(),
            self.rows.load(Ordering::Relaxed)
        )
    }
}

impl Default for LoadProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// What a load pass did.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub libraries: usize,
    pub media_rows: u64,
    pub availability_rows: u64,
    pub indexed: u64,
    pub warm_start: bool,
}

/// Run the full load pipeline.
///
/// `force_cold` re-runs the CSV passes even over a warm store (the
/// prebaking path). Store failures abort; per-row problems never do.
pub fn run(
    kv: &Kv,
    feeds: &FeedDir,
    libraries: &LibraryRegistry,
    formats: &FormatTable,
    index: &SearchIndex,
    progress: &LoadProgress,
    force_cold: bool,
) -> DeepResult<IngestReport> {
    let started = std::time::Instant::now();
    let mut report = IngestReport::default();

    progress.set_phase(LoadPhase::Libraries);
    report.libraries = load_libraries(feeds.open(LIBRARIES_FEED)?, libraries)?;

    let warm = kv.is_warm() && !force_cold;
    report.warm_start = warm;

    progress.set_phase(LoadPhase::Media);
    if warm {
        tracing::info!("media already loaded, skipping feed");
    } else {
        report.media_rows = load_media(kv, feeds.open(MEDIA_FEED)?, progress.rows())?;
    }

    progress.set_phase(LoadPhase::Availability);
    if warm {
        tracing::info!("availability already loaded, skipping feed");
        let recovered = formats.recover(kv).map_err(CatalogError::Store)?;
        tracing::info!(formats = recovered, "format dictionary recovered");
    } else {
        report.availability_rows = load_availability(
            kv,
            feeds.open(AVAILABILITY_FEED)?,
            libraries,
            formats,
            progress.rows(),
        )?;
    }

    progress.set_phase(LoadPhase::Indexing);
    report.indexed = build_index(kv, index, progress.rows())?;
    index.finalize();
    progress.set_phase(LoadPhase::Ready);

    tracing::info!(
        libraries = report.libraries,
        media = report.media_rows,
        availability = report.availability_rows,
        indexed = report.indexed,
        warm = report.warm_start,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "load complete"
    );
    Ok(report)
}

/// Stream the `mk` prefix and index every record, batching decodes so the
/// rayon pool works on slices while memory stays bounded by one batch.
fn build_index(kv: &Kv, index: &SearchIndex, rows: &AtomicU64) -> DeepResult<u64> {
    let mut batch: Vec<crate::catalog::Media> = Vec::with_capacity(INDEX_BATCH);
    let mut indexed = 0u64;

    kv.for_each_prefix(keys::MEDIA_PREFIX, |_key, blob| {
        match media::decode_media(blob) {
            Ok(record) => batch.push(record),
            Err(e) => {
                tracing::warn!(error = %e, "undecodable media blob, skipping");
                return;
            }
        }
        if batch.len() >= INDEX_BATCH {
            index.index_batch(&batch);
            indexed += batch.len() as u64;
            rows.store(indexed, Ordering::Relaxed);
            batch.clear();
        }
    })
    .map_err(CatalogError::Store)?;

    if !batch.is_empty() {
        index.index_batch(&batch);
        indexed += batch.len() as u64;
        rows.store(indexed, Ordering::Relaxed);
    }
    tracing::info!(records = indexed, "index build complete");
    Ok(indexed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::feed::testutil::gz_csv;
    use tempfile::TempDir;

    fn write_feeds(dir: &std::path::Path) {
        std::fs::write(
            dir.join(LIBRARIES_FEED),
            gz_csv("oakpl,77,Oak Public Library,false\nelmco,78,Elm Consortium,true\n"),
        )
        .unwrap();
        // Enough records that the loaded store crosses the warm threshold.
        let mut media = String::from(
            "42,The Gray Fox,,english,,ebook,,,,0,,Vulpine Press,901\n\
             43,Quantum Garden,,english,,ebook,,,,0,,Vulpine Press,901\n",
        );
        let mut availability = String::from("42,oakpl,3,1,5,7,ebook\n43,elmco,1,1,0,0,ebook\n");
        for id in 1000..1400 {
            media.push_str(&format!(
                "{id},Filler Volume {id} of the Long Shelf,,english,,ebook,,,,0,,Vulpine Press,901\n"
            ));
            availability.push_str(&format!("{id},oakpl,1,1,0,0,ebook\n"));
        }
        std::fs::write(dir.join(MEDIA_FEED), gz_csv(&media)).unwrap();
        std::fs::write(dir.join(AVAILABILITY_FEED), gz_csv(&availability)).unwrap();
    }

    fn components(dir: &TempDir) -> (Kv, LibraryRegistry, FormatTable, SearchIndex) {
        (
            Kv::open(&dir.path().join("catalog.redb")).unwrap(),
            LibraryRegistry::new(),
            FormatTable::new(),
            SearchIndex::new(),
        )
    }

    #[test]
    fn cold_load_builds_everything() {
        let dir = TempDir::new().unwrap();
        write_feeds(dir.path());
        let (kv, libraries, formats, index) = components(&dir);
        let progress = LoadProgress::new();
        let feeds = FeedDir::new(dir.path());

        let report = run(&kv, &feeds, &libraries, &formats, &index, &progress, false).unwrap();
        assert!(!report.warm_start);
        assert_eq!(report.libraries, 2);
        assert_eq!(report.media_rows, 402);
        assert_eq!(report.availability_rows, 402);
        assert_eq!(report.indexed, 402);
        assert!(progress.is_ready());
        assert!(index.is_finalized());
        assert!(index.search("gray fox").contains(42));
    }

    #[test]
    fn warm_start_skips_feeds_but_rebuilds_index() {
        let dir = TempDir::new().unwrap();
        write_feeds(dir.path());
        let feeds = FeedDir::new(dir.path());

        {
            let (kv, libraries, formats, index) = components(&dir);
            let progress = LoadProgress::new();
            run(&kv, &feeds, &libraries, &formats, &index, &progress, false).unwrap();
        }

        // Remove the media and availability feeds: a warm start must not
        // need them.
        std::fs::remove_file(dir.path().join(MEDIA_FEED)).unwrap();
        std::fs::remove_file(dir.path().join(AVAILABILITY_FEED)).unwrap();

        let (kv, libraries, formats, index) = components(&dir);
        let progress = LoadProgress::new();
        let report = run(&kv, &feeds, &libraries, &formats, &index, &progress, false).unwrap();
        assert!(report.warm_start);
        assert_eq!(report.media_rows, 0);
        assert_eq!(report.indexed, 402);
        assert!(!formats.is_empty());
        assert!(index.search("quantum").contains(43));
    }

    #[test]
    fn progress_description_moves_through_phases() {
        let progress = LoadProgress::new();
        assert!(!progress.is_ready());
        assert!(progress.describe().contains("libraries"));
        progress.set_phase(LoadPhase::Media);
        progress.rows().store(12345, Ordering::Relaxed);
        let line = progress.describe();
        assert!(line.contains("media"));
        assert!(line.contains("12345"));
        progress.set_phase(LoadPhase::Ready);
        assert!(progress.is_ready());
        assert_eq!(progress.describe(), "ready");
    }

    #[test]
    fn missing_feed_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (kv, libraries, formats, index) = components(&dir);
        let progress = LoadProgress::new();
        let feeds = FeedDir::new(dir.path());
        let result = run(&kv, &feeds, &libraries, &formats, &index, &progress, false);
        assert!(result.is_err());
        assert!(!progress.is_ready());
    }
}
