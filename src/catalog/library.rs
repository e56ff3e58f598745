//! Lending libraries: external ids, dense ordinals, bidirectional registry.
//!
//! The [`LibraryRegistry`] provides O(1) lookups in both directions using
//! two `DashMap`s. Ordinals are dense `u16`s assigned in feed order and are
//! what the availability key layouts pack; the registry is immutable once
//! the libraries feed has loaded.

use std::io::Read;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::catalog::feed;
use crate::error::CatalogResult;

/// One lending institution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    /// Stable external string id (e.g. "oakpl").
    pub id: String,
    /// Upstream website id.
    pub website_id: u32,
    /// Human-readable name.
    pub name: String,
    /// Whether this is a consortium of member libraries.
    pub is_consortium: bool,
}

/// Bidirectional registry: external id to ordinal, ordinal to [`Library`].
pub struct LibraryRegistry {
    by_external: DashMap<String, u16>,
    by_ordinal: DashMap<u16, Library>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            by_external: DashMap::new(),
            by_ordinal: DashMap::new(),
        }
    }

    /// Register a library, assigning the next dense ordinal on first sight.
    /// Re-registering an external id updates the record under its existing
    /// ordinal.
    pub fn insert(&self, library: Library) -> u16 {
        let ordinal = match self.by_external.get(&library.id) {
            Some(existing) => *existing.value(),
            None => {
                let ordinal = self.by_external.len() as u16;
                self.by_external.insert(library.id.clone(), ordinal);
                ordinal
            }
        };
        self.by_ordinal.insert(ordinal, library);
        ordinal
    }

    /// Look up the dense ordinal for an external id.
    pub fn ordinal(&self, external_id: &str) -> Option<u16> {
        self.by_external.get(external_id).map(|r| *r.value())
    }

    /// Look up a library by ordinal.
    pub fn get(&self, ordinal: u16) -> Option<Library> {
        self.by_ordinal.get(&ordinal).map(|r| r.value().clone())
    }

    /// Look up a library by external id.
    pub fn get_by_external(&self, external_id: &str) -> Option<Library> {
        self.ordinal(external_id).and_then(|ord| self.get(ord))
    }

    /// All registered libraries.
    pub fn all(&self) -> Vec<Library> {
        self.by_ordinal.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_ordinal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ordinal.is_empty()
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LibraryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryRegistry")
            .field("count", &self.len())
            .finish()
    }
}

/// Load the libraries feed into the registry.
///
/// Columns: external-id, website-id, name, is-consortium. A malformed
/// website-id logs and defaults to 0; a short row logs and is skipped.
pub fn load_libraries<R: Read>(reader: R, registry: &LibraryRegistry) -> CatalogResult<usize> {
    let mut csv = feed::csv_reader(reader);
    let mut loaded = 0usize;
    for (row_idx, row) in csv.records().enumerate() {
        let record = match row {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(row = row_idx, error = %e, "skipping malformed libraries row");
                continue;
            }
        };
        let (Some(external_id), Some(website_id), Some(name), Some(is_consortium)) = (
            record.get(0),
            record.get(1),
            record.get(2),
            record.get(3),
        ) else {
            tracing::warn!(row = row_idx, "libraries row has too few columns, skipping");
            continue;
        };
        let website_id = website_id.parse::<u32>().unwrap_or_else(|e| {
            tracing::warn!(row = row_idx, library = external_id, error = %e,
                "malformed website id, defaulting to 0");
            0
        });
        registry.insert(Library {
            id: external_id.to_string(),
            website_id,
            name: name.to_string(),
            is_consortium: is_consortium == "true",
        });
        loaded += 1;
    }
    tracing::info!(libraries = loaded, "done reading libraries");
    Ok(loaded)
}
