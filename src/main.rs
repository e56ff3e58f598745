//! deepstacks CLI: catalog search service over library availability feeds.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::Result;

use deepstacks::bookshelf::HardcoverClient;
use deepstacks::catalog::feed::FeedDir;
use deepstacks::catalog::{FormatTable, LibraryRegistry};
use deepstacks::config::ServiceConfig;
use deepstacks::index::SearchIndex;
use deepstacks::ingest::{self, LoadProgress};
use deepstacks::query::Services;
use deepstacks::server::{self, AppState};
use deepstacks::store::Kv;

#[derive(Parser)]
#[command(name = "deepstacks", version, about = "Catalog search with per-library availability")]
struct Cli {
    /// Directory holding the gzipped CSV feeds.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Path of the database file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the catalog and serve the HTTP API.
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Ingest the feeds into the store, then exit (prebake the database).
    Load,

    /// One-shot search against the local catalog.
    Search {
        /// Free-text query.
        query: String,
    },

    /// Show catalog statistics.
    Info,
}

/// Everything a command needs, wired together.
#[derive(Clone)]
struct App {
    services: Arc<Services>,
    kv: Arc<Kv>,
    feeds: FeedDir,
    libraries: Arc<LibraryRegistry>,
    formats: Arc<FormatTable>,
    index: Arc<SearchIndex>,
    progress: Arc<LoadProgress>,
    config: ServiceConfig,
}

fn build(cli: &Cli) -> Result<App> {
    let mut config = ServiceConfig::from_env();
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }

    let kv = Arc::new(Kv::open(&config.db_path).map_err(deepstacks::error::DeepError::from)?);
    let libraries = Arc::new(LibraryRegistry::new());
    let formats = Arc::new(FormatTable::new());
    let index = Arc::new(SearchIndex::new());
    let feeds = FeedDir::new(&config.data_dir);
    let progress = Arc::new(LoadProgress::new());

    let mut services = Services::new(
        Arc::clone(&kv),
        Arc::clone(&libraries),
        Arc::clone(&formats),
        Arc::clone(&index),
    );
    if let Some(token) = &config.hardcover_token {
        services = services.with_bookshelf(Box::new(HardcoverClient::new(token.clone())));
    }

    Ok(App {
        services: Arc::new(services),
        kv,
        feeds,
        libraries,
        formats,
        index,
        progress,
        config,
    })
}

fn load(app: &App, force_cold: bool) -> Result<ingest::IngestReport> {
    let report = ingest::run(
        &app.kv,
        &app.feeds,
        &app.libraries,
        &app.formats,
        &app.index,
        &app.progress,
        force_cold,
    )?;
    Ok(report)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if std::env::var("LOCAL_TESTING").as_deref() == Ok("true") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let app = build(&cli)?;

    match cli.command {
        Commands::Serve { bind } => {
            if app.config.load_only {
                tracing::info!("LOAD_ONLY set, ingesting then exiting");
                load(&app, true)?;
                return Ok(());
            }

            // The load runs off-thread so the server can bind immediately
            // and answer 503 with progress until the gate opens. A load
            // failure is fatal for the whole process, exactly as it would
            // be inline.
            let loader_app = app.clone();
            std::thread::spawn(move || {
                if let Err(err) = load(&loader_app, false) {
                    tracing::error!(error = %err, "catalog load failed");
                    std::process::exit(1);
                }
            });

            let state = Arc::new(AppState {
                services: Arc::clone(&app.services),
                progress: Arc::clone(&app.progress),
            });
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");
            runtime
                .block_on(server::serve(&bind, state))
                .map_err(|e| miette::miette!("server error: {e}"))?;
        }

        Commands::Load => {
            let report = load(&app, true)?;
            tracing::info!(
                media = report.media_rows,
                availability = report.availability_rows,
                "load finished, shutting down"
            );
        }

        Commands::Search { query } => {
            load(&app, false)?;
            let hits = app
                .services
                .search(&query)
                .map_err(deepstacks::error::DeepError::from)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&hits)
                    .map_err(|e| miette::miette!("encode failed: {e}"))?
            );
        }

        Commands::Info => {
            load(&app, false)?;
            println!("libraries:     {}", app.libraries.len());
            println!("formats:       {}", app.formats.len());
            println!("ngrams:        {}", app.index.ngram_count());
            println!("isbns:         {}", app.index.isbn_count());
            println!("store bytes:   {}", app.kv.estimated_size());
            println!("store path:    {}", app.kv.path().display());
        }
    }

    Ok(())
}
