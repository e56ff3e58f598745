//! The bibliographic catalog: feeds, libraries, records, and availability.
//!
//! Three gzipped CSV feeds populate the catalog:
//!
//! - `libraries.csv.gz` into the in-memory [`library::LibraryRegistry`]
//! - `media.csv.gz` into `mk` rows of the persistent store
//! - `availability.csv.gz` into paired `ma`/`la` rows plus the
//!   [`availability::FormatTable`]
//!
//! Records are written once during cold load and only read back afterwards,
//! so the loaders never retain rows in memory.

pub mod availability;
pub mod feed;
pub mod library;
pub mod media;

pub use availability::{FormatTable, MediaCounts};
pub use library::{Library, LibraryRegistry};
pub use media::{Creator, Media};
