//! Fixed key layouts for the catalog store.
//!
//! All multi-byte integers are packed big-endian so lexicographic key order
//! equals numeric order, which the prefix scans in the query engine rely on:
//! an `la` scan yields a library's records in ascending record-id order, and
//! an `ma` scan yields a record's libraries in ascending ordinal order.
//!
//! Layouts:
//! - `"mk" || decimal(record_id)`                      record blob
//! - `"ma" || u32_be(record_id) || u16_be(library)`    counts, record-major
//! - `"la" || u16_be(library) || u32_be(record_id)`    counts, library-major
//! - `"fmt" || u8(code)`                               format string

/// Prefix for record metadata blobs.
pub const MEDIA_PREFIX: &[u8] = b"mk";
/// Prefix for record-major availability rows.
pub const MEDIA_AVAIL_PREFIX: &[u8] = b"ma";
/// Prefix for library-major availability rows.
pub const LIBRARY_AVAIL_PREFIX: &[u8] = b"la";
/// Prefix for format dictionary entries.
pub const FORMAT_PREFIX: &[u8] = b"fmt";

/// Key for a record's metadata blob.
pub fn media_key(record_id: u32) -> Vec<u8> {
    let mut key = MEDIA_PREFIX.to_vec();
    key.extend_from_slice(record_id.to_string().as_bytes());
    key
}

/// Key for a record-major availability row.
pub fn media_avail_key(record_id: u32, library_ord: u16) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..2].copy_from_slice(MEDIA_AVAIL_PREFIX);
    key[2..6].copy_from_slice(&record_id.to_be_bytes());
    key[6..8].copy_from_slice(&library_ord.to_be_bytes());
    key
}

/// Key for a library-major availability row.
pub fn library_avail_key(library_ord: u16, record_id: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..2].copy_from_slice(LIBRARY_AVAIL_PREFIX);
    key[2..4].copy_from_slice(&library_ord.to_be_bytes());
    key[4..8].copy_from_slice(&record_id.to_be_bytes());
    key
}

/// Scan prefix covering every library holding one record.
pub fn media_avail_prefix(record_id: u32) -> [u8; 6] {
    let mut prefix = [0u8; 6];
    prefix[..2].copy_from_slice(MEDIA_AVAIL_PREFIX);
    prefix[2..6].copy_from_slice(&record_id.to_be_bytes());
    prefix
}

/// Scan prefix covering every record held by one library.
pub fn library_avail_prefix(library_ord: u16) -> [u8; 4] {
    let mut prefix = [0u8; 4];
    prefix[..2].copy_from_slice(LIBRARY_AVAIL_PREFIX);
    prefix[2..4].copy_from_slice(&library_ord.to_be_bytes());
    prefix
}

/// Key for a format dictionary entry.
pub fn format_key(code: u8) -> [u8; 4] {
    let mut key = [0u8; 4];
    key[..3].copy_from_slice(FORMAT_PREFIX);
    key[3] = code;
    key
}

/// The library ordinal packed in an `ma` key.
pub fn library_ord_from_ma_key(key: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = key.get(6..8)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

/// The record id packed in an `la` key.
pub fn record_id_from_la_key(key: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = key.get(4..8)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// The format code packed in a `fmt` key.
pub fn format_code_from_key(key: &[u8]) -> Option<u8> {
    key.get(3).copied()
}
