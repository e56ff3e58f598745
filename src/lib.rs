//! # deepstacks
//!
//! Aggregate search over a bibliographic catalog enriched with per-library
//! availability. Free-text queries return ranked records annotated with the
//! lending libraries that stock them; comparison queries answer what one
//! library has that another lacks.
//!
//! ## Architecture
//!
//! - **Store** (`store`): ordered byte-keyed persistence on redb, with the
//!   `mk`/`ma`/`la`/`fmt` key layouts
//! - **Catalog** (`catalog`): libraries, records, availability, and the
//!   gzipped CSV feeds that populate them
//! - **Index** (`index`): character-n-gram posting lists over roaring
//!   bitmaps, facet bitmaps, ISBN table
//! - **Query** (`query`): search, availability, diff, intersect, unique,
//!   bookshelf search, and ranking
//! - **Ingest** (`ingest`): cold/warm startup pipeline and the load gate
//! - **Server** (`server`): the axum `/api` surface
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use deepstacks::catalog::{FormatTable, LibraryRegistry};
//! use deepstacks::index::SearchIndex;
//! use deepstacks::query::Services;
//! use deepstacks::store::Kv;
//!
//! let kv = Arc::new(Kv::open("deepstacks.redb".as_ref()).unwrap());
//! let services = Services::new(
//!     kv,
//!     Arc::new(LibraryRegistry::new()),
//!     Arc::new(FormatTable::new()),
//!     Arc::new(SearchIndex::new()),
//! );
//! let _hits = services.search("the gray fox").unwrap();
//! ```

pub mod bookshelf;
pub mod catalog;
pub mod config;
pub mod error;
pub mod index;
pub mod ingest;
pub mod ngram;
pub mod query;
pub mod server;
pub mod store;
