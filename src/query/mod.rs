//! The query engine: search, availability, diff, intersect, unique.
//!
//! [`Services`] composes the store, the library registry, the format table,
//! and the search index, and is what request handlers are given instead of
//! process-wide singletons. All responses are hydrated per request and owned
//! by the response.

pub mod rank;

use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::Serialize;

use crate::bookshelf::Bookshelf;
use crate::catalog::availability::MediaCounts;
use crate::catalog::media::{self, parse_isbn13, Media};
use crate::catalog::{FormatTable, Library, LibraryRegistry};
use crate::error::{QueryError, QueryResult};
use crate::index::SearchIndex;
use crate::ngram::fold;
use crate::store::{keys, Kv};
use rank::{RankInput, RankStrategy, SubstringRank};

/// Soft cap on hydrated hits per search response, applied before ranking.
pub const MAX_SEARCH_RESULTS: usize = 500;

/// Aggregator pseudo-library excluded from availability listings.
pub const KINDLE_PSEUDO_LIBRARY: &str = "uskindle";

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

/// One hydrated search result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: u32,
    pub title: String,
    pub creators: Vec<media::Creator>,
    pub publisher: String,
    pub publisher_id: u32,
    pub cover_url: String,
    pub subtitle: String,
    pub description: String,
    pub series_name: String,
    pub series_read_order: u16,
    pub library_count: u64,
    pub languages: Vec<String>,
    pub formats: Vec<String>,
}

/// Counts with format codes resolved to strings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountsView {
    pub owned_count: u16,
    pub available_count: u16,
    pub holds_count: u16,
    pub estimated_wait_days: i16,
    pub formats: Vec<String>,
}

/// Counts attributed to one library.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryMediaCounts {
    pub library: Library,
    #[serde(flatten)]
    pub counts: CountsView,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Serialize)]
pub struct LibrariesResponse {
    pub libraries: Vec<Library>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    #[serde(flatten)]
    pub record: SearchHit,
    pub availability: Vec<LibraryMediaCounts>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    #[serde(flatten)]
    pub record: SearchHit,
    pub library: Library,
    #[serde(flatten)]
    pub counts: CountsView,
}

#[derive(Debug, Serialize)]
pub struct DiffResponse {
    pub diff: Vec<DiffEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntersectEntry {
    #[serde(flatten)]
    pub record: SearchHit,
    pub left_library_media_counts: LibraryMediaCounts,
    pub right_library_media_counts: LibraryMediaCounts,
}

#[derive(Debug, Serialize)]
pub struct IntersectResponse {
    pub intersect: Vec<IntersectEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueEntry {
    #[serde(flatten)]
    pub record: SearchHit,
    #[serde(flatten)]
    pub counts: CountsView,
}

#[derive(Debug, Serialize)]
pub struct UniqueResponse {
    pub library: Library,
    pub unique: Vec<UniqueEntry>,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Top-level handle over every read-path subsystem.
pub struct Services {
    kv: Arc<Kv>,
    libraries: Arc<LibraryRegistry>,
    formats: Arc<FormatTable>,
    index: Arc<SearchIndex>,
    ranker: Box<dyn RankStrategy>,
    bookshelf: Option<Box<dyn Bookshelf>>,
}

impl Services {
    pub fn new(
        kv: Arc<Kv>,
        libraries: Arc<LibraryRegistry>,
        formats: Arc<FormatTable>,
        index: Arc<SearchIndex>,
    ) -> Self {
        Self {
            kv,
            libraries,
            formats,
            index,
            ranker: Box::new(SubstringRank),
            bookshelf: None,
        }
    }

    /// Swap the ranking strategy.
    pub fn with_ranker(mut self, ranker: Box<dyn RankStrategy>) -> Self {
        self.ranker = ranker;
        self
    }

    /// Attach a bookshelf client for `/api/search-hardcover`.
    pub fn with_bookshelf(mut self, bookshelf: Box<dyn Bookshelf>) -> Self {
        self.bookshelf = Some(bookshelf);
        self
    }

    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    pub fn libraries(&self) -> &LibraryRegistry {
        &self.libraries
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    // -----------------------------------------------------------------------
    // search
    // -----------------------------------------------------------------------

    /// Free-text search: evaluate the index, hydrate up to
    /// [`MAX_SEARCH_RESULTS`] candidates, rank them.
    pub fn search(&self, query: &str) -> QueryResult<Vec<SearchHit>> {
        let started = std::time::Instant::now();
        let candidates = self.index.search(query);

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut inputs: Vec<RankInput> = Vec::new();
        for id in candidates.iter().take(MAX_SEARCH_RESULTS) {
            let Some((hit, searchable)) = self.hydrate(id)? else {
                continue;
            };
            inputs.push(RankInput {
                searchable,
                library_count: hit.library_count,
            });
            hits.push(hit);
        }

        let order = self.ranker.order(query, &inputs);
        let mut slots: Vec<Option<SearchHit>> = hits.into_iter().map(Some).collect();
        let ranked: Vec<SearchHit> = order
            .into_iter()
            .filter_map(|i| slots.get_mut(i).and_then(Option::take))
            .collect();

        tracing::info!(
            q = query,
            results = ranked.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search"
        );
        Ok(ranked)
    }

    /// Hydrate one record: metadata blob, library count, facet membership.
    ///
    /// Returns the hit plus the folded searchable text used by ranking.
    /// `Ok(None)` (with a logged warning) when the record blob is missing,
    /// so callers skip the hit instead of failing the request.
    fn hydrate(&self, id: u32) -> QueryResult<Option<(SearchHit, String)>> {
        let Some(record) = media::get_media(&self.kv, id)? else {
            tracing::warn!(id, "record referenced but missing from store, skipping");
            return Ok(None);
        };
        let library_count = self.library_count(id)?;
        let searchable = searchable_text(&record);
        let hit = SearchHit {
            id: record.id,
            title: record.title,
            creators: record.creators,
            publisher: record.publisher,
            publisher_id: record.publisher_id,
            cover_url: record.cover_url,
            subtitle: record.subtitle,
            description: record.description,
            series_name: record.series,
            series_read_order: record.series_read_order,
            library_count,
            languages: self.index.languages_of(id),
            formats: self.index.formats_of(id),
        };
        Ok(Some((hit, searchable)))
    }

    /// Number of `ma` rows for a record. A scan failure logs and returns
    /// the partial count rather than failing the whole request.
    fn library_count(&self, id: u32) -> QueryResult<u64> {
        let mut count = 0u64;
        if let Err(e) = self
            .kv
            .for_each_prefix(&keys::media_avail_prefix(id), |_, _| count += 1)
        {
            tracing::error!(id, error = %e, "library count scan failed, using partial count");
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // availability
    // -----------------------------------------------------------------------

    /// All libraries holding one record. `Ok(None)` for an unknown record.
    pub fn availability(&self, id: u32) -> QueryResult<Option<AvailabilityResponse>> {
        let Some((record, _)) = self.hydrate(id)? else {
            return Ok(None);
        };

        let mut rows: Vec<(u16, MediaCounts)> = Vec::new();
        if let Err(e) = self
            .kv
            .for_each_prefix(&keys::media_avail_prefix(id), |key, payload| {
                let Some(ord) = keys::library_ord_from_ma_key(key) else {
                    return;
                };
                if let Some(counts) = MediaCounts::unpack(payload) {
                    rows.push((ord, counts));
                }
            })
        {
            tracing::error!(id, error = %e, "availability scan failed, returning partial results");
        }

        let mut availability = Vec::with_capacity(rows.len());
        for (ord, counts) in rows {
            let Some(library) = self.libraries.get(ord) else {
                tracing::warn!(ordinal = ord, "availability row for unknown library, skipping");
                continue;
            };
            if library.id == KINDLE_PSEUDO_LIBRARY {
                continue;
            }
            availability.push(LibraryMediaCounts {
                library,
                counts: self.counts_view(&counts),
            });
        }
        Ok(Some(AvailabilityResponse {
            record,
            availability,
        }))
    }

    // -----------------------------------------------------------------------
    // diff / intersect / unique
    // -----------------------------------------------------------------------

    /// Records held by `left` but not `right`.
    pub fn diff(&self, left: &str, right: &str) -> QueryResult<DiffResponse> {
        let (left_ord, left_library) = self.resolve_library(left)?;
        let (right_ord, _) = self.resolve_library(right)?;

        let left_catalog = self.library_catalog(left_ord)?;
        let right_catalog = self.library_catalog(right_ord)?;
        tracing::info!(
            left = %left_library.id,
            right,
            left_count = left_catalog.len(),
            right_count = right_catalog.len(),
            "diff"
        );

        let mut diff = Vec::new();
        let mut right_iter = right_catalog.iter().map(|(id, _)| *id).peekable();
        for (id, counts) in left_catalog {
            while right_iter.peek().is_some_and(|r| *r < id) {
                right_iter.next();
            }
            if right_iter.peek() == Some(&id) {
                continue;
            }
            let Some((record, _)) = self.hydrate(id)? else {
                continue;
            };
            diff.push(DiffEntry {
                record,
                library: left_library.clone(),
                counts: self.counts_view(&counts),
            });
        }
        Ok(DiffResponse { diff })
    }

    /// Records held by both libraries, with each side's counts.
    pub fn intersect(&self, left: &str, right: &str) -> QueryResult<IntersectResponse> {
        let (left_ord, left_library) = self.resolve_library(left)?;
        let (right_ord, right_library) = self.resolve_library(right)?;

        let left_catalog = self.library_catalog(left_ord)?;
        let right_catalog = self.library_catalog(right_ord)?;
        tracing::info!(
            left = %left_library.id,
            right = %right_library.id,
            left_count = left_catalog.len(),
            right_count = right_catalog.len(),
            "intersect"
        );

        let mut intersect = Vec::new();
        let mut right_iter = right_catalog.into_iter().peekable();
        for (id, left_counts) in left_catalog {
            while right_iter.peek().is_some_and(|(r, _)| *r < id) {
                right_iter.next();
            }
            let Some((right_id, _)) = right_iter.peek() else {
                break;
            };
            if *right_id != id {
                continue;
            }
            let Some((_, right_counts)) = right_iter.next() else {
                break;
            };
            let Some((record, _)) = self.hydrate(id)? else {
                continue;
            };
            intersect.push(IntersectEntry {
                record,
                left_library_media_counts: LibraryMediaCounts {
                    library: left_library.clone(),
                    counts: self.counts_view(&left_counts),
                },
                right_library_media_counts: LibraryMediaCounts {
                    library: right_library.clone(),
                    counts: self.counts_view(&right_counts),
                },
            });
        }
        Ok(IntersectResponse { intersect })
    }

    /// Records held by exactly one library, that library being the given one.
    pub fn unique(&self, library: &str) -> QueryResult<UniqueResponse> {
        let (ord, library) = self.resolve_library(library)?;
        let catalog = self.library_catalog(ord)?;

        let mut unique = Vec::new();
        for (id, counts) in catalog {
            let mut holders = 0u32;
            if let Err(e) = self
                .kv
                .for_each_prefix_while(&keys::media_avail_prefix(id), |_, _| {
                    holders += 1;
                    holders < 2
                })
            {
                // An undercounted record would be wrongly reported as
                // unique, so a failed scan drops it instead.
                tracing::error!(id, error = %e, "holder scan failed, skipping record");
                continue;
            }
            if holders != 1 {
                continue;
            }
            let Some((record, _)) = self.hydrate(id)? else {
                continue;
            };
            unique.push(UniqueEntry {
                record,
                counts: self.counts_view(&counts),
            });
        }
        tracing::info!(library = %library.id, unique = unique.len(), "unique");
        Ok(UniqueResponse { library, unique })
    }

    // -----------------------------------------------------------------------
    // ISBN / bookshelf search
    // -----------------------------------------------------------------------

    /// Search by a list of ISBN-13 strings, optionally narrowed by a
    /// free-text filter evaluated against the n-gram index.
    pub fn search_by_isbns(
        &self,
        isbns: &[String],
        additional_filters: &str,
    ) -> QueryResult<Vec<SearchHit>> {
        let mut bitmap = RoaringBitmap::new();
        for isbn in isbns {
            let Some(isbn13) = parse_isbn13(isbn) else {
                continue;
            };
            if let Some(id) = self.index.isbn_lookup(isbn13) {
                bitmap.insert(id);
            }
        }
        tracing::info!(
            isbns = isbns.len(),
            matched = bitmap.len(),
            "isbn search"
        );

        if !additional_filters.trim().is_empty() {
            bitmap &= self.index.search(additional_filters);
        }

        let mut results = Vec::with_capacity(bitmap.len() as usize);
        for id in bitmap.iter() {
            if let Some((hit, _)) = self.hydrate(id)? {
                results.push(hit);
            }
        }
        Ok(results)
    }

    /// Search against a bookshelf user's ISBNs.
    pub fn search_bookshelf(
        &self,
        username: &str,
        additional_filters: &str,
    ) -> QueryResult<Vec<SearchHit>> {
        let Some(bookshelf) = self.bookshelf.as_deref() else {
            return Err(QueryError::NoBookshelf);
        };
        let isbns = bookshelf.isbns_for_user(username)?;
        self.search_by_isbns(&isbns, additional_filters)
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    fn resolve_library(&self, external_id: &str) -> QueryResult<(u16, Library)> {
        let ord = self
            .libraries
            .ordinal(external_id)
            .ok_or_else(|| QueryError::UnknownLibrary {
                id: external_id.to_string(),
            })?;
        let library = self
            .libraries
            .get(ord)
            .ok_or_else(|| QueryError::UnknownLibrary {
                id: external_id.to_string(),
            })?;
        Ok((ord, library))
    }

    /// One library's catalog as `(record id, counts)`, ascending by id.
    /// The `la` key layout makes the scan come back already sorted. A scan
    /// failure logs and yields the partial catalog.
    fn library_catalog(&self, ord: u16) -> QueryResult<Vec<(u32, MediaCounts)>> {
        let mut catalog = Vec::new();
        if let Err(e) = self
            .kv
            .for_each_prefix(&keys::library_avail_prefix(ord), |key, payload| {
                let Some(id) = keys::record_id_from_la_key(key) else {
                    return;
                };
                if let Some(counts) = MediaCounts::unpack(payload) {
                    catalog.push((id, counts));
                }
            })
        {
            tracing::error!(ordinal = ord, error = %e, "catalog scan failed, returning partial results");
        }
        Ok(catalog)
    }

    fn counts_view(&self, counts: &MediaCounts) -> CountsView {
        CountsView {
            owned_count: counts.owned,
            available_count: counts.available,
            holds_count: counts.holds,
            estimated_wait_days: counts.wait_days,
            formats: self.formats.names(&counts.formats),
        }
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("libraries", &self.libraries.len())
            .field("ngrams", &self.index.ngram_count())
            .finish()
    }
}

/// Folded concatenation of a record's searchable strings, for ranking.
fn searchable_text(record: &Media) -> String {
    let mut text = String::with_capacity(
        record.title.len() + record.subtitle.len() + record.publisher.len() + 32,
    );
    for part in [
        record.title.as_str(),
        record.subtitle.as_str(),
        record.publisher.as_str(),
        record.series.as_str(),
    ] {
        if !part.is_empty() {
            text.push_str(part);
            text.push(' ');
        }
    }
    for creator in &record.creators {
        text.push_str(&creator.name);
        text.push(' ');
    }
    for identifier in &record.identifiers {
        text.push_str(identifier);
        text.push(' ');
    }
    fold(text.trim_end())
}
