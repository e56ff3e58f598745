//! In-memory character-n-gram search index.
//!
//! Maps every 1..=3 byte n-gram of the indexed strings to a compressed
//! sorted set of record ids, alongside the ISBN-13 table and the facet
//! bitmaps (format and language membership). Build is concurrent: the map
//! itself is a `DashMap` and every posting list sits behind its own
//! `RwLock`, so appenders on disjoint n-grams never serialize. After
//! [`SearchIndex::finalize`] the structure is effectively immutable and
//! queries only take read locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;
use roaring::RoaringBitmap;

use crate::catalog::media::{parse_isbn13, Media};
use crate::ngram::{self, Ngram};

/// N-gram search index with facet bitmaps and ISBN lookup.
pub struct SearchIndex {
    /// n-gram to posting list. Each posting has its own lock.
    postings: DashMap<Ngram, RwLock<RoaringBitmap>>,
    /// ISBN-13 to record id.
    isbn13: DashMap<u64, u32>,
    /// Lowercased format string to record set.
    format_facets: DashMap<String, RwLock<RoaringBitmap>>,
    /// Lowercased language string to record set.
    language_facets: DashMap<String, RwLock<RoaringBitmap>>,
    sealed: AtomicBool,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self {
            postings: DashMap::new(),
            isbn13: DashMap::new(),
            format_facets: DashMap::new(),
            language_facets: DashMap::new(),
            sealed: AtomicBool::new(false),
        }
    }

    // -----------------------------------------------------------------------
    // Build
    // -----------------------------------------------------------------------

    /// Append `id` to the posting list of every n-gram of `text`.
    pub fn index_text(&self, text: &str, id: u32) {
        debug_assert!(!self.is_finalized(), "index_text after finalize");
        for gram in ngram::ngrams(text) {
            let posting = self
                .postings
                .entry(gram)
                .or_insert_with(|| RwLock::new(RoaringBitmap::new()));
            posting.write().expect("posting lock poisoned").insert(id);
        }
    }

    /// Index every searchable string of a record: space-padded title,
    /// subtitle, publisher, the publisher-id compound, series with its
    /// `#<order>` token, creator names, identifiers (ISBNs also enter the
    /// ISBN table), and the lowercased languages and formats (which also
    /// populate the facet bitmaps).
    pub fn index_media(&self, media: &Media) {
        let id = media.id;
        self.index_text(&format!(" {} ", media.title), id);
        self.index_text(&format!(" {} ", media.subtitle), id);
        self.index_text(&format!(" {} ", media.publisher), id);
        self.index_text(&format!(" {}-{} ", media.publisher, media.publisher_id), id);
        if !media.series.is_empty() {
            self.index_text(&format!("#{}", media.series_read_order), id);
            self.index_text(&format!(" {} ", media.series), id);
        }
        for creator in &media.creators {
            self.index_text(&format!(" {} ", creator.name), id);
        }
        for identifier in &media.identifiers {
            self.index_text(&format!(" {} ", identifier), id);
            if let Some(isbn) = parse_isbn13(identifier) {
                self.index_isbn(isbn, id);
            }
        }
        for language in &media.languages {
            self.index_facet(&self.language_facets, language, id);
        }
        for format in &media.formats {
            self.index_facet(&self.format_facets, format, id);
        }
    }

    /// Index a batch of records across the rayon pool.
    pub fn index_batch(&self, batch: &[Media]) {
        use rayon::prelude::*;
        batch.par_iter().for_each(|media| self.index_media(media));
    }

    fn index_facet(&self, facets: &DashMap<String, RwLock<RoaringBitmap>>, value: &str, id: u32) {
        let lowered = value.to_lowercase();
        {
            let bitmap = facets
                .entry(lowered.clone())
                .or_insert_with(|| RwLock::new(RoaringBitmap::new()));
            bitmap.write().expect("facet lock poisoned").insert(id);
        }
        self.index_text(&lowered, id);
    }

    /// Register an ISBN-13 for a record.
    pub fn index_isbn(&self, isbn13: u64, id: u32) {
        self.isbn13.insert(isbn13, id);
    }

    /// Seal the index. Idempotent; must run before the first query.
    pub fn finalize(&self) {
        if !self.sealed.swap(true, Ordering::SeqCst) {
            tracing::info!(
                ngrams = self.postings.len(),
                isbns = self.isbn13.len(),
                formats = self.format_facets.len(),
                languages = self.language_facets.len(),
                "search index finalized"
            );
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Query
    // -----------------------------------------------------------------------

    /// Evaluate a query: AND-intersect the posting lists of its n-grams.
    ///
    /// Empty n-gram set (empty or stop-word-only query) and any unknown
    /// n-gram both yield the empty set, never the full catalog.
    pub fn search(&self, query: &str) -> RoaringBitmap {
        debug_assert!(self.is_finalized(), "search before finalize");
        let grams = ngram::query_ngrams(query);
        if grams.is_empty() {
            return RoaringBitmap::new();
        }
        let mut result: Option<RoaringBitmap> = None;
        for gram in &grams {
            let Some(posting) = self.postings.get(gram) else {
                return RoaringBitmap::new();
            };
            let guard = posting.read().expect("posting lock poisoned");
            match result.as_mut() {
                None => result = Some(guard.clone()),
                Some(acc) => {
                    *acc &= &*guard;
                    if acc.is_empty() {
                        return RoaringBitmap::new();
                    }
                }
            }
        }
        result.unwrap_or_default()
    }

    /// Look up a record id by ISBN-13.
    pub fn isbn_lookup(&self, isbn13: u64) -> Option<u32> {
        self.isbn13.get(&isbn13).map(|r| *r.value())
    }

    /// Debug probe: does the posting list for this (folded) n-gram contain
    /// the record? `None` when no such posting exists.
    pub fn posting_contains(&self, gram: &str, id: u32) -> Option<bool> {
        let folded = ngram::fold(gram);
        let bytes = folded.as_bytes();
        if bytes.is_empty() || bytes.len() > ngram::MAX_NGRAM_LEN || bytes.contains(&b' ') {
            return None;
        }
        let grams = ngram::ngrams(&folded);
        let gram = grams.iter().find(|g| g.as_bytes() == bytes)?;
        self.postings
            .get(gram)
            .map(|posting| posting.read().expect("posting lock poisoned").contains(id))
    }

    /// Formats of a record, from the facet bitmaps, sorted alphabetically.
    pub fn formats_of(&self, id: u32) -> Vec<String> {
        Self::facet_members(&self.format_facets, id)
    }

    /// Languages of a record, from the facet bitmaps, sorted alphabetically.
    pub fn languages_of(&self, id: u32) -> Vec<String> {
        Self::facet_members(&self.language_facets, id)
    }

    fn facet_members(facets: &DashMap<String, RwLock<RoaringBitmap>>, id: u32) -> Vec<String> {
        let mut members: Vec<String> = facets
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .read()
                    .expect("facet lock poisoned")
                    .contains(id)
            })
            .map(|entry| entry.key().clone())
            .collect();
        members.sort();
        members
    }

    /// Number of distinct n-grams.
    pub fn ngram_count(&self) -> usize {
        self.postings.len()
    }

    /// Number of ISBN-13 entries.
    pub fn isbn_count(&self) -> usize {
        self.isbn13.len()
    }
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex")
            .field("ngrams", &self.postings.len())
            .field("isbns", &self.isbn13.len())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(id: u32, title: &str) -> Media {
        Media {
            id,
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn built(records: &[Media]) -> SearchIndex {
        let index = SearchIndex::new();
        for record in records {
            index.index_media(record);
        }
        index.finalize();
        index
    }

    #[test]
    fn search_intersects_across_words() {
        let index = built(&[
            media(1, "Quantum Garden"),
            media(2, "Garden of Forking Paths"),
            media(3, "Quantum Mechanics"),
        ]);
        let hits: Vec<u32> = index.search("quantum garden").iter().collect();
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn search_results_ascend_without_duplicates() {
        let index = built(&[media(9, "garden"), media(3, "garden"), media(7, "garden")]);
        let hits: Vec<u32> = index.search("garden").iter().collect();
        assert_eq!(hits, vec![3, 7, 9]);
    }

    #[test]
    fn diacritics_fold_to_ascii() {
        let index = built(&[media(5, "Café Noir")]);
        assert!(index.search("cafe").contains(5));
        assert!(index.search("café").contains(5));
    }

    #[test]
    fn unknown_ngram_yields_empty() {
        let index = built(&[media(1, "Quantum Garden")]);
        assert!(index.search("xyzzy").is_empty());
    }

    #[test]
    fn empty_and_stop_word_queries_yield_empty() {
        let index = built(&[media(1, "Quantum Garden")]);
        assert!(index.search("").is_empty());
        assert!(index.search("   ").is_empty());
        assert!(index.search("and & by").is_empty());
    }

    #[test]
    fn narrowing_a_query_never_grows_results() {
        let index = built(&[
            media(1, "Quantum Garden"),
            media(2, "Quantum Mechanics"),
            media(3, "Quiet Quantum Nights"),
        ]);
        let broad = index.search("quantum");
        let narrow = index.search("quantum gar");
        assert!(narrow.is_subset(&broad));
    }

    #[test]
    fn stop_words_are_elided_in_queries() {
        let index = built(&[media(1, "Fire Ice")]);
        let with_stop = index.search("fire and ice");
        let without = index.search("fire ice");
        assert_eq!(with_stop, without);
        assert!(with_stop.contains(1));
    }

    #[test]
    fn series_and_creator_fields_are_searchable() {
        let mut record = media(11, "Some Title");
        record.series = "Foxes".into();
        record.series_read_order = 3;
        record.creators = vec![crate::catalog::media::Creator {
            name: "Ana".into(),
            ..Default::default()
        }];
        let index = built(std::slice::from_ref(&record));
        assert!(index.search("foxes").contains(11));
        assert!(index.search("#3").contains(11));
        assert!(index.search("ana").contains(11));
    }

    #[test]
    fn identifiers_feed_the_isbn_table() {
        let mut record = media(17, "Identified");
        record.identifiers = vec!["9780000000001".into(), "OTHER-9".into()];
        let index = built(std::slice::from_ref(&record));
        assert_eq!(index.isbn_lookup(9_780_000_000_001), Some(17));
        assert_eq!(index.isbn_count(), 1);
        // Identifier text is searchable either way.
        assert!(index.search("9780000000001").contains(17));
    }

    #[test]
    fn facets_record_membership_sorted() {
        let mut record = media(21, "Faceted");
        record.formats = vec!["Ebook".into(), "Audiobook".into()];
        record.languages = vec!["English".into()];
        let index = built(std::slice::from_ref(&record));
        assert_eq!(index.formats_of(21), vec!["audiobook", "ebook"]);
        assert_eq!(index.languages_of(21), vec!["english"]);
        assert!(index.formats_of(99).is_empty());
        // Facet values are searchable as text.
        assert!(index.search("ebook").contains(21));
    }

    #[test]
    fn finalize_is_idempotent() {
        let index = built(&[media(1, "Once")]);
        assert!(index.is_finalized());
        index.finalize();
        assert!(index.is_finalized());
    }

    #[test]
    fn debug_probe_matches_search_membership() {
        let index = built(&[media(1, "Quantum Garden")]);
        assert_eq!(index.posting_contains("qua", 1), Some(true));
        assert_eq!(index.posting_contains("qua", 2), Some(false));
        assert_eq!(index.posting_contains("zzz", 1), None);
        assert_eq!(index.posting_contains("toolong", 1), None);
    }

    #[test]
    fn parallel_batch_build_matches_serial() {
        let records: Vec<Media> = (0..200)
            .map(|i| media(i, if i % 2 == 0 { "Quantum Garden" } else { "Garden" }))
            .collect();

        let parallel = SearchIndex::new();
        parallel.index_batch(&records);
        parallel.finalize();

        let serial = built(&records);
        assert_eq!(parallel.search("quantum"), serial.search("quantum"));
        assert_eq!(parallel.search("garden"), serial.search("garden"));
        assert_eq!(parallel.ngram_count(), serial.ngram_count());
    }
}
