//! Persistence tests: warm starts, dual-key parity, dictionary recovery.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

use deepstacks::catalog::availability::MediaCounts;
use deepstacks::catalog::feed::{FeedDir, AVAILABILITY_FEED, LIBRARIES_FEED, MEDIA_FEED};
use deepstacks::catalog::{FormatTable, LibraryRegistry};
use deepstacks::index::SearchIndex;
use deepstacks::ingest::{self, LoadProgress};
use deepstacks::store::{keys, Kv};

fn write_gz(path: &Path, body: &str) {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(body.as_bytes()).unwrap();
    std::fs::write(path, enc.finish().unwrap()).unwrap();
}

/// Availability pairs written by [`write_feeds`]: 4 handwritten plus one
/// filler row per filler record.
const EXPECTED_PAIRS: usize = 4 + 400;

fn write_feeds(dir: &Path) {
    write_gz(
        &dir.join(LIBRARIES_FEED),
        "oakpl,77,Oak Public Library,false\nelmco,78,Elm Consortium,true\n",
    );
    // Filler records push the loaded store over the warm threshold so the
    // restart path is the one real deployments take.
    let mut media = String::from(
        "42,The Gray Fox,,english,,ebook,,,,0,,Vulpine Press,901\n\
         43,Quantum Garden,,english,,ebook,,,,0,,Vulpine Press,901\n\
         44,Quantum Mechanics,,english,,ebook,,,,0,,Vulpine Press,901\n",
    );
    let mut availability = String::from(
        "42,oakpl,3,1,5,7,ebook\n\
         43,oakpl,1,0,2,14,ebook;audiobook\n\
         43,elmco,2,2,0,0,ebook\n\
         44,elmco,65535,1,1,3,audiobook\n",
    );
    for id in 1000..1400 {
        media.push_str(&format!(
            "{id},Filler Volume {id} of the Long Shelf,,english,,ebook,,,,0,,Vulpine Press,901\n"
        ));
        availability.push_str(&format!("{id},oakpl,1,1,0,0,ebook\n"));
    }
    write_gz(&dir.join(MEDIA_FEED), &media);
    write_gz(&dir.join(AVAILABILITY_FEED), &availability);
}

fn load(
    dir: &Path,
    db: &Path,
) -> (Arc<Kv>, Arc<LibraryRegistry>, Arc<FormatTable>, Arc<SearchIndex>) {
    let kv = Arc::new(Kv::open(db).unwrap());
    let libraries = Arc::new(LibraryRegistry::new());
    let formats = Arc::new(FormatTable::new());
    let index = Arc::new(SearchIndex::new());
    let progress = LoadProgress::new();
    ingest::run(
        &kv,
        &FeedDir::new(dir),
        &libraries,
        &formats,
        &index,
        &progress,
        false,
    )
    .unwrap();
    (kv, libraries, formats, index)
}

#[test]
fn ma_and_la_rows_agree_for_every_pair() {
    let dir = TempDir::new().unwrap();
    write_feeds(dir.path());
    let db = dir.path().join("catalog.redb");
    let (kv, libraries, _formats, _index) = load(dir.path(), &db);

    // Walk every la row and check the mirrored ma row is byte-identical.
    let mut pairs = 0;
    for ord in 0..libraries.len() as u16 {
        for (key, payload) in kv.scan_prefix(&keys::library_avail_prefix(ord)).unwrap() {
            let record_id = keys::record_id_from_la_key(&key).unwrap();
            let ma = kv
                .get(&keys::media_avail_key(record_id, ord))
                .unwrap()
                .expect("ma row missing for la row");
            assert_eq!(ma, payload);
            pairs += 1;
        }
    }
    assert_eq!(pairs, EXPECTED_PAIRS);
}

#[test]
fn counts_obey_storage_invariants() {
    let dir = TempDir::new().unwrap();
    write_feeds(dir.path());
    let db = dir.path().join("catalog.redb");
    let (kv, _libraries, _formats, _index) = load(dir.path(), &db);

    kv.for_each_prefix(keys::MEDIA_AVAIL_PREFIX, |_key, payload| {
        let counts = MediaCounts::unpack(payload).unwrap();
        // Saturated, never wrapped.
        assert!(counts.owned <= u16::MAX);
        if counts.available > counts.holds {
            assert_eq!(counts.wait_days, 0);
        }
    })
    .unwrap();

    // The 65535-owned row survived saturation intact.
    let ord = 1u16; // elmco was second in the feed
    let payload = kv.get(&keys::media_avail_key(44, ord)).unwrap().unwrap();
    assert_eq!(MediaCounts::unpack(&payload).unwrap().owned, u16::MAX);
}

#[test]
fn la_scan_yields_ascending_record_ids() {
    let dir = TempDir::new().unwrap();
    write_feeds(dir.path());
    let db = dir.path().join("catalog.redb");
    let (kv, libraries, _formats, _index) = load(dir.path(), &db);

    let ord = libraries.ordinal("elmco").unwrap();
    let mut last = None;
    kv.for_each_prefix(&keys::library_avail_prefix(ord), |key, _| {
        let id = keys::record_id_from_la_key(key).unwrap();
        if let Some(last) = last {
            assert!(id > last, "la scan out of order: {last} then {id}");
        }
        last = Some(id);
    })
    .unwrap();
    assert!(last.is_some());
}

#[test]
fn warm_start_reuses_the_store_and_recovers_formats() {
    let dir = TempDir::new().unwrap();
    write_feeds(dir.path());
    let db = dir.path().join("catalog.redb");

    let first = load(dir.path(), &db);
    assert!(first.0.is_warm());
    let ebook_code = first.2.code("ebook").unwrap();
    let audio_code = first.2.code("audiobook").unwrap();
    drop(first);

    // Deleting the big feeds proves the second start never reads them.
    std::fs::remove_file(dir.path().join(MEDIA_FEED)).unwrap();
    std::fs::remove_file(dir.path().join(AVAILABILITY_FEED)).unwrap();

    let (kv, _libraries, formats, index) = load(dir.path(), &db);
    assert!(kv.is_warm());

    // Same dictionary codes after recovery.
    assert_eq!(formats.code("ebook"), Some(ebook_code));
    assert_eq!(formats.code("audiobook"), Some(audio_code));

    // The rebuilt index still answers from the persisted records.
    assert!(index.search("gray fox").contains(42));
    assert!(index.search("quantum").contains(43));
}

#[test]
fn posting_lists_are_strictly_increasing() {
    let dir = TempDir::new().unwrap();
    write_feeds(dir.path());
    let db = dir.path().join("catalog.redb");
    let (_kv, _libraries, _formats, index) = load(dir.path(), &db);

    // Roaring iteration is ascending and deduplicated by construction;
    // verify through the public search surface.
    let ids: Vec<u32> = index.search("quantum").iter().collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ids, sorted);
    assert_eq!(ids, vec![43, 44]);
}
