//! Diagnostic error types for deepstacks.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]`
//! derives, providing error codes, help text, and source chains. The
//! top-level [`DeepError`] preserves the full diagnostic chain through to
//! the operator.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the deepstacks service.
#[derive(Debug, Error, Diagnostic)]
pub enum DeepError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bookshelf(#[from] BookshelfError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(deepstacks::store::io),
        help(
            "A filesystem operation failed. Check that the database directory \
             exists, has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(deepstacks::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             This may indicate corruption; try removing the database file \
             so the next start re-runs the cold load."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(deepstacks::store::serde),
        help(
            "Failed to encode or decode a stored record blob. This usually \
             means the stored format changed between versions; re-ingest \
             the feeds with a fresh database."
        )
    )]
    Serialization { message: String },
}

// ---------------------------------------------------------------------------
// Catalog / ingest errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("cannot open feed {path}: {source}")]
    #[diagnostic(
        code(deepstacks::catalog::feed),
        help(
            "A feed file could not be opened. Verify the data directory \
             (DEEPSTACKS_DATA or --data-dir) and that the gzipped CSV \
             exists there."
        )
    )]
    Feed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("feed read error in {feed}: {message}")]
    #[diagnostic(
        code(deepstacks::catalog::csv),
        help(
            "The CSV stream could not be advanced. The feed may be \
             truncated or not actually gzip-compressed."
        )
    )]
    Csv { feed: String, message: String },

    #[error("format dictionary is full, cannot intern \"{format}\"")]
    #[diagnostic(
        code(deepstacks::catalog::format_table_full),
        help(
            "The format dictionary holds at most 256 distinct format \
             strings. An upstream feed producing more than that is \
             malformed; the offending format is dropped from its rows."
        )
    )]
    FormatTableFull { format: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Query errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum QueryError {
    #[error("unknown library id \"{id}\"")]
    #[diagnostic(
        code(deepstacks::query::unknown_library),
        help("Use /api/libraries to list the known external library ids.")
    )]
    UnknownLibrary { id: String },

    #[error("no record with id {id}")]
    #[diagnostic(
        code(deepstacks::query::unknown_record),
        help("The record id is not present in the catalog. It may have been dropped upstream.")
    )]
    UnknownRecord { id: u32 },

    #[error("no bookshelf client is configured")]
    #[diagnostic(
        code(deepstacks::query::no_bookshelf),
        help("Set HARDCOVER_API_TOKEN so the server can query the bookshelf API.")
    )]
    NoBookshelf,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bookshelf(#[from] BookshelfError),
}

// ---------------------------------------------------------------------------
// Bookshelf client errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum BookshelfError {
    #[error("bookshelf request failed: {message}")]
    #[diagnostic(
        code(deepstacks::bookshelf::request),
        help(
            "The GraphQL request to the bookshelf API failed. Check network \
             connectivity and that HARDCOVER_API_TOKEN is still valid."
        )
    )]
    Request { message: String },

    #[error("bookshelf response could not be decoded: {message}")]
    #[diagnostic(
        code(deepstacks::bookshelf::decode),
        help("The bookshelf API returned a body that does not match the expected GraphQL shape.")
    )]
    Decode { message: String },

    #[error("no bookshelf user named \"{username}\"")]
    #[diagnostic(
        code(deepstacks::bookshelf::no_user),
        help("The username does not exist on the bookshelf service, or their shelf is private.")
    )]
    NoUser { username: String },
}

/// Convenience alias for functions returning deepstacks results.
pub type DeepResult<T> = std::result::Result<T, DeepError>;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for catalog/ingest operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Result type for query operations.
pub type QueryResult<T> = std::result::Result<T, QueryError>;
