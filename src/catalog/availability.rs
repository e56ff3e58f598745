//! Per-library availability: packed counts rows and the format dictionary.
//!
//! Every feed row is written under two keys, `ma` (record-major) and `la`
//! (library-major), with byte-identical payloads, so both scan directions
//! are O(rows-for-prefix) without a secondary index. Payload layout, big
//! endian: owned u16 at 0, available u16 at 2, holds u16 at 4, wait i16 at
//! 6, then one format code byte per format.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::catalog::library::LibraryRegistry;
use crate::error::{CatalogError, CatalogResult, StoreResult};
use crate::store::{keys, Kv};

/// Rows per write transaction during cold load. Each row produces two
/// entries, so the transaction holds twice this many inserts.
const WRITE_BATCH_ROWS: usize = 4096;

/// Packed length of the fixed count fields.
pub const COUNTS_FIXED_LEN: usize = 8;

/// Ownership snapshot for one (record, library) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaCounts {
    pub owned: u16,
    pub available: u16,
    pub holds: u16,
    pub wait_days: i16,
    /// Format codes resolved through the [`FormatTable`].
    pub formats: Vec<u8>,
}

impl MediaCounts {
    /// Pack into the shared `ma`/`la` payload layout.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COUNTS_FIXED_LEN + self.formats.len());
        buf.extend_from_slice(&self.owned.to_be_bytes());
        buf.extend_from_slice(&self.available.to_be_bytes());
        buf.extend_from_slice(&self.holds.to_be_bytes());
        buf.extend_from_slice(&self.wait_days.to_be_bytes());
        buf.extend_from_slice(&self.formats);
        buf
    }

    /// Unpack a payload. `None` when the row is shorter than the fixed
    /// fields (a corrupt or foreign row).
    pub fn unpack(payload: &[u8]) -> Option<Self> {
        if payload.len() < COUNTS_FIXED_LEN {
            return None;
        }
        let word = |at: usize| u16::from_be_bytes([payload[at], payload[at + 1]]);
        Some(Self {
            owned: word(0),
            available: word(2),
            holds: word(4),
            wait_days: word(6) as i16,
            formats: payload[COUNTS_FIXED_LEN..].to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Format dictionary
// ---------------------------------------------------------------------------

/// Process-wide bijection between format strings and single-byte codes.
///
/// Built on first encounter during availability ingest and persisted under
/// `fmt` keys so warm starts recover the same mapping.
pub struct FormatTable {
    by_name: DashMap<String, u8>,
    by_code: DashMap<u8, String>,
}

impl FormatTable {
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_code: DashMap::new(),
        }
    }

    /// Intern a format string, persisting the `fmt` row on first sight.
    ///
    /// Errors with [`CatalogError::FormatTableFull`] once 256 distinct
    /// formats exist; callers drop the format from the row and continue.
    pub fn intern(&self, kv: &Kv, name: &str) -> CatalogResult<u8> {
        if let Some(code) = self.by_name.get(name) {
            return Ok(*code.value());
        }
        let next = self.by_name.len();
        if next > u8::MAX as usize {
            return Err(CatalogError::FormatTableFull {
                format: name.to_string(),
            });
        }
        let code = next as u8;
        kv.put(&keys::format_key(code), name.as_bytes())
            .map_err(CatalogError::Store)?;
        self.by_name.insert(name.to_string(), code);
        self.by_code.insert(code, name.to_string());
        Ok(code)
    }

    /// Recover the persisted dictionary from the `fmt` prefix.
    pub fn recover(&self, kv: &Kv) -> StoreResult<usize> {
        let mut recovered = 0usize;
        kv.for_each_prefix(keys::FORMAT_PREFIX, |key, value| {
            let Some(code) = keys::format_code_from_key(key) else {
                return;
            };
            let name = String::from_utf8_lossy(value).to_string();
            self.by_name.insert(name.clone(), code);
            self.by_code.insert(code, name);
            recovered += 1;
        })?;
        Ok(recovered)
    }

    /// Resolve a code to its format string.
    pub fn name(&self, code: u8) -> Option<String> {
        self.by_code.get(&code).map(|r| r.value().clone())
    }

    /// Resolve a format string to its code.
    pub fn code(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).map(|r| *r.value())
    }

    /// Resolve a packed code list to format strings, skipping unknown codes.
    pub fn names(&self, codes: &[u8]) -> Vec<String> {
        codes.iter().filter_map(|c| self.name(*c)).collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for FormatTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FormatTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatTable")
            .field("count", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Feed load
// ---------------------------------------------------------------------------

/// Stream the availability feed into paired `ma`/`la` rows.
///
/// Columns: record-id, library-external-id, owned, available, holds, wait,
/// formats(;). Counts saturate to their storage width with a warning; wait
/// is clamped to 0 whenever available > holds. Rows naming an unknown
/// library are logged and skipped.
pub fn load_availability<R: Read>(
    kv: &Kv,
    reader: R,
    libraries: &LibraryRegistry,
    formats: &FormatTable,
    rows_seen: &AtomicU64,
) -> CatalogResult<u64> {
    let mut csv = crate::catalog::feed::csv_reader(reader);
    let mut batch: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(WRITE_BATCH_ROWS * 2);
    let mut written = 0u64;

    for (row_idx, row) in csv.records().enumerate() {
        let record = match row {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(row = row_idx, error = %e, "skipping malformed availability row");
                continue;
            }
        };
        rows_seen.fetch_add(1, Ordering::Relaxed);
        if record.len() < 7 {
            tracing::warn!(row = row_idx, columns = record.len(),
                "availability row has too few columns, skipping");
            continue;
        }
        let col = |i: usize| record.get(i).unwrap_or_default();

        let record_id = match col(0).parse::<u64>() {
            Ok(raw) => raw as u32,
            Err(e) => {
                tracing::error!(row = row_idx, id = col(0), error = %e,
                    "unparseable record id, skipping row");
                continue;
            }
        };
        let Some(library_ord) = libraries.ordinal(col(1)) else {
            tracing::warn!(row = row_idx, library = col(1),
                "availability row references unknown library, skipping");
            continue;
        };

        let owned = saturating_u16(row_idx, "owned", col(2));
        let available = saturating_u16(row_idx, "available", col(3));
        let holds = saturating_u16(row_idx, "holds", col(4));
        let mut wait_days = saturating_i16(row_idx, "wait", col(5));
        if available > holds {
            wait_days = 0;
        }

        let mut format_codes = Vec::new();
        for format in col(6).split(';').filter(|s| !s.is_empty()) {
            match formats.intern(kv, format) {
                Ok(code) => format_codes.push(code),
                Err(CatalogError::FormatTableFull { .. }) => {
                    tracing::error!(row = row_idx, format, "format dictionary full, dropping format");
                }
                Err(e) => return Err(e),
            }
        }

        let counts = MediaCounts {
            owned,
            available,
            holds,
            wait_days,
            formats: format_codes,
        };
        let payload = counts.pack();
        batch.push((keys::media_avail_key(record_id, library_ord).to_vec(), payload.clone()));
        batch.push((keys::library_avail_key(library_ord, record_id).to_vec(), payload));

        if batch.len() >= WRITE_BATCH_ROWS * 2 {
            kv.put_batch(std::mem::take(&mut batch))
                .map_err(CatalogError::Store)?;
        }
        written += 1;
        if written % 1_000_000 == 0 {
            tracing::info!(rows = written, "availability load progress");
        }
    }
    if !batch.is_empty() {
        kv.put_batch(batch).map_err(CatalogError::Store)?;
    }
    tracing::info!(rows = written, formats = formats.len(), "done reading availability feed");
    Ok(written)
}

fn saturating_u16(row_idx: usize, field: &str, value: &str) -> u16 {
    match value.parse::<u64>() {
        Ok(raw) if raw > u16::MAX as u64 => {
            tracing::warn!(row = row_idx, field, value = raw, "count exceeds u16, saturating");
            u16::MAX
        }
        Ok(raw) => raw as u16,
        Err(e) => {
            tracing::warn!(row = row_idx, field, value, error = %e,
                "unparseable count, defaulting to 0");
            0
        }
    }
}

fn saturating_i16(row_idx: usize, field: &str, value: &str) -> i16 {
    match value.parse::<i64>() {
        Ok(raw) if raw > i16::MAX as i64 => {
            tracing::warn!(row = row_idx, field, value = raw, "wait exceeds i16, saturating");
            i16::MAX
        }
        Ok(raw) if raw < i16::MIN as i64 => {
            tracing::warn!(row = row_idx, field, value = raw, "wait below i16, saturating");
            i16::MIN
        }
        Ok(raw) => raw as i16,
        Err(e) => {
            tracing::warn!(row = row_idx, field, value, error = %e,
                "unparseable wait, defaulting to 0");
            0
        }
    }
}
