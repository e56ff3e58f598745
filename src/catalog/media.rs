//! Record metadata: the media feed, `mk` blobs, and read-back.
//!
//! Cold load streams the media feed row by row, writing each record as a
//! bincode blob under its `mk` key in batches. Records are not retained in
//! memory: the index build re-reads them through an `mk` prefix scan, which
//! keeps peak RSS bounded by one write batch.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, CatalogResult, StoreError, StoreResult};
use crate::store::{keys, Kv};

/// Rows per write transaction during cold load.
const WRITE_BATCH_ROWS: usize = 4096;

/// One contributor tuple from the feed's creators JSON column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    #[serde(default)]
    pub id: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub sort_name: String,
}

/// One catalog record (a book, audiobook, etc.).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub id: u32,
    pub title: String,
    pub subtitle: String,
    pub description: String,
    pub cover_url: String,
    pub publisher: String,
    pub publisher_id: u32,
    pub series: String,
    pub series_read_order: u16,
    pub creators: Vec<Creator>,
    pub formats: Vec<String>,
    pub languages: Vec<String>,
    /// Opaque external identifiers, notably ISBN-13s.
    pub identifiers: Vec<String>,
}

/// Encode a record for its `mk` row.
pub fn encode_media(media: &Media) -> StoreResult<Vec<u8>> {
    bincode::serialize(media).map_err(|e| StoreError::Serialization {
        message: format!("failed to encode media {}: {e}", media.id),
    })
}

/// Decode a record blob read from an `mk` row.
pub fn decode_media(blob: &[u8]) -> StoreResult<Media> {
    bincode::deserialize(blob).map_err(|e| StoreError::Serialization {
        message: format!("failed to decode media blob: {e}"),
    })
}

/// Fetch one record by id. `Ok(None)` when the id has no `mk` row.
pub fn get_media(kv: &Kv, id: u32) -> StoreResult<Option<Media>> {
    match kv.get(&keys::media_key(id))? {
        Some(blob) => Ok(Some(decode_media(&blob)?)),
        None => Ok(None),
    }
}

/// Stream the media feed into `mk` rows.
///
/// Returns the number of records written. `rows_seen` is bumped per row for
/// progress reporting. Malformed rows are logged and skipped; a store
/// failure aborts the load.
pub fn load_media<R: Read>(kv: &Kv, reader: R, rows_seen: &AtomicU64) -> CatalogResult<u64> {
    let mut csv = crate::catalog::feed::csv_reader(reader);
    let mut batch: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(WRITE_BATCH_ROWS);
    let mut written = 0u64;

    for (row_idx, row) in csv.records().enumerate() {
        let record = match row {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(row = row_idx, error = %e, "skipping malformed media row");
                continue;
            }
        };
        rows_seen.fetch_add(1, Ordering::Relaxed);
        let Some(media) = parse_media_row(row_idx, &record) else {
            continue;
        };
        let blob = encode_media(&media).map_err(CatalogError::Store)?;
        batch.push((keys::media_key(media.id), blob));
        if batch.len() >= WRITE_BATCH_ROWS {
            kv.put_batch(std::mem::take(&mut batch))
                .map_err(CatalogError::Store)?;
        }
        written += 1;
        if written % 100_000 == 0 {
            tracing::info!(records = written, "media load progress");
        }
    }
    if !batch.is_empty() {
        kv.put_batch(batch).map_err(CatalogError::Store)?;
    }
    tracing::info!(records = written, "done reading media feed");
    Ok(written)
}

/// Parse one media feed row.
///
/// Columns: id, title, creators-json, languages(;), cover, formats(;),
/// subtitle, description, series, series-order, identifiers(;), publisher,
/// publisher-id. Returns `None` (with a logged reason) when the row cannot
/// produce a record.
pub(crate) fn parse_media_row(row_idx: usize, record: &csv::StringRecord) -> Option<Media> {
    if record.len() < 13 {
        tracing::warn!(row = row_idx, columns = record.len(), "media row has too few columns");
        return None;
    }
    let col = |i: usize| record.get(i).unwrap_or_default();

    let id = match col(0).parse::<u64>() {
        Ok(raw) => {
            if raw > u32::MAX as u64 {
                tracing::warn!(row = row_idx, id = raw, "media id exceeds 32 bits, truncating");
            }
            raw as u32
        }
        Err(e) => {
            tracing::error!(row = row_idx, id = col(0), error = %e, "unparseable media id, skipping row");
            return None;
        }
    };

    let creators: Vec<Creator> = if col(2).is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(col(2)).unwrap_or_else(|e| {
            tracing::warn!(row = row_idx, id, error = %e, "malformed creators JSON");
            Vec::new()
        })
    };

    let publisher_id = match col(12).parse::<u32>() {
        Ok(pid) => pid,
        Err(e) => {
            tracing::error!(row = row_idx, id, publisher_id = col(12), error = %e,
                "unparseable publisher id, skipping row");
            return None;
        }
    };

    let series_read_order = col(9).parse::<u16>().unwrap_or_else(|e| {
        tracing::warn!(row = row_idx, id, order = col(9), error = %e,
            "malformed series read order, defaulting to 0");
        0
    });

    Some(Media {
        id,
        title: col(1).to_string(),
        creators,
        languages: split_semis(col(3)),
        cover_url: col(4).to_string(),
        formats: split_semis(col(5)),
        subtitle: col(6).to_string(),
        description: col(7).to_string(),
        series: col(8).to_string(),
        series_read_order,
        identifiers: split_semis(col(10)),
        publisher: col(11).to_string(),
        publisher_id,
    })
}

/// Split a semicolon-joined feed column, dropping empty segments.
fn split_semis(value: &str) -> Vec<String> {
    value
        .split(';')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether an identifier is an indexable ISBN-13 (13 digits, 978/979).
pub fn parse_isbn13(identifier: &str) -> Option<u64> {
    if identifier.len() == 13
        && (identifier.starts_with("978") || identifier.starts_with("979"))
        && identifier.bytes().all(|b| b.is_ascii_digit())
    {
        identifier.parse::<u64>().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn media_row(fields: &[&str]) -> csv::StringRecord {
        csv::StringRecord::from(fields.to_vec())
    }

    fn sample_row() -> csv::StringRecord {
        media_row(&[
            "42",
            "The Gray Fox",
            r#"[{"id":7,"name":"Ana","role":"Author","sortName":"Ana"}]"#,
            "english;french",
            "https://covers.example/42.jpg",
            "ebook;audiobook",
            "A Vulpine Tale",
            "A fox goes gray.",
            "Foxes",
            "3",
            "9780000000001;OTHER-9",
            "Vulpine Press",
            "901",
        ])
    }

    #[test]
    fn parse_full_row() {
        let media = parse_media_row(0, &sample_row()).unwrap();
        assert_eq!(media.id, 42);
        assert_eq!(media.title, "The Gray Fox");
        assert_eq!(media.creators.len(), 1);
        assert_eq!(media.creators[0].name, "Ana");
        assert_eq!(media.languages, vec!["english", "french"]);
        assert_eq!(media.formats, vec!["ebook", "audiobook"]);
        assert_eq!(media.series_read_order, 3);
        assert_eq!(media.identifiers, vec!["9780000000001", "OTHER-9"]);
        assert_eq!(media.publisher_id, 901);
    }

    #[test]
    fn malformed_series_order_defaults_to_zero() {
        let mut fields: Vec<String> = sample_row().iter().map(str::to_string).collect();
        fields[9] = "third".into();
        let row = csv::StringRecord::from(fields);
        assert_eq!(parse_media_row(0, &row).unwrap().series_read_order, 0);
    }

    #[test]
    fn malformed_creators_json_yields_empty() {
        let mut fields: Vec<String> = sample_row().iter().map(str::to_string).collect();
        fields[2] = "{not json".into();
        let row = csv::StringRecord::from(fields);
        assert!(parse_media_row(0, &row).unwrap().creators.is_empty());
    }

    #[test]
    fn unparseable_id_skips_row() {
        let mut fields: Vec<String> = sample_row().iter().map(str::to_string).collect();
        fields[0] = "abc".into();
        let row = csv::StringRecord::from(fields);
        assert!(parse_media_row(0, &row).is_none());
    }

    #[test]
    fn oversized_id_is_truncated() {
        let mut fields: Vec<String> = sample_row().iter().map(str::to_string).collect();
        fields[0] = (u32::MAX as u64 + 43).to_string();
        let row = csv::StringRecord::from(fields);
        assert_eq!(parse_media_row(0, &row).unwrap().id, 42);
    }

    #[test]
    fn blob_round_trip_through_store() {
        let dir = TempDir::new().unwrap();
        let kv = Kv::open(&dir.path().join("catalog.redb")).unwrap();
        let media = parse_media_row(0, &sample_row()).unwrap();
        kv.put(&keys::media_key(media.id), &encode_media(&media).unwrap())
            .unwrap();

        let read_back = get_media(&kv, 42).unwrap().unwrap();
        assert_eq!(read_back, media);
        assert!(get_media(&kv, 43).unwrap().is_none());
    }

    #[test]
    fn load_feed_end_to_end() {
        let dir = TempDir::new().unwrap();
        let kv = Kv::open(&dir.path().join("catalog.redb")).unwrap();
        let body = "42,The Gray Fox,,english,,ebook,,,,1,,Vulpine Press,901\n\
                    bad,row,with,unparseable,id,,,,,,,,\n\
                    43,Quantum Garden,,english,,ebook,,,,0,,Vulpine Press,901\n";
        let rows = AtomicU64::new(0);
        let written = load_media(&kv, body.as_bytes(), &rows).unwrap();
        assert_eq!(written, 2);
        assert_eq!(rows.load(Ordering::Relaxed), 3);
        assert_eq!(get_media(&kv, 43).unwrap().unwrap().title, "Quantum Garden");
    }

    #[test]
    fn isbn13_detection() {
        assert_eq!(parse_isbn13("9780000000001"), Some(9_780_000_000_001));
        assert_eq!(parse_isbn13("9790000000001"), Some(9_790_000_000_001));
        assert_eq!(parse_isbn13("9770000000001"), None);
        assert_eq!(parse_isbn13("978000000001"), None);
        assert_eq!(parse_isbn13("97800000x0001"), None);
    }
}
