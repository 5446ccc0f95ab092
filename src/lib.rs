pub mod config;
pub mod error;
pub mod indexer;
pub mod model;
pub mod search;
pub mod storage;
pub mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use crate::indexer::TmIndexer;
use crate::search::cascade::{TmSearcher, DEFAULT_NPC_THRESHOLD, DEFAULT_THRESHOLD, DEFAULT_TOP_K};
use crate::search::embedder_registry;
use crate::storage::EntryStore;
use crate::sync::TmSyncManager;

fn long_version() -> String {
    format!(
        "{} (built {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_BUILD_DATE").unwrap_or("unknown")
    )
}

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "tms",
    version,
    long_version = long_version(),
    about = "Translation-memory indexing, cascade search, and sync"
)]
pub struct Cli {
    /// Override data dir (index bundles + db). Defaults to platform data dir.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Path to the SQLite entry store (defaults to <data_dir>/tm_store.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Embedding engine name
    #[arg(long, global = true, env = "TMS_ENGINE")]
    pub engine: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add one entry to a TM
    Add {
        /// TM identifier
        #[arg(long)]
        tm: String,

        /// Source text
        source: String,

        /// Target (translated) text
        #[arg(long)]
        target: Option<String>,

        /// String id disambiguating repeated sources
        #[arg(long)]
        string_id: Option<String>,
    },
    /// Rebuild or incrementally update a TM's index bundle
    Sync {
        #[arg(long)]
        tm: String,
    },
    /// Run the cascade search against a synced TM
    Search {
        #[arg(long)]
        tm: String,

        /// Query text
        query: String,

        #[arg(long, default_value_t = DEFAULT_TOP_K)]
        top_k: usize,

        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f32,

        /// Check this translation for consistency against the TM matches
        #[arg(long)]
        check_target: Option<String>,

        /// Consistency threshold used with --check-target
        #[arg(long, default_value_t = DEFAULT_NPC_THRESHOLD)]
        npc_threshold: f32,
    },
    /// List the embedding engines this build knows about
    Engines,
}

pub fn run() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(config::default_data_dir);
    let db_path = cli.db.unwrap_or_else(|| config::default_db_path(&data_dir));
    if let Some(name) = &cli.engine {
        config::set_current_engine_name(name);
    }

    match cli.command {
        Commands::Add {
            tm,
            source,
            target,
            string_id,
        } => {
            let store = EntryStore::open(&db_path).context("opening entry store")?;
            let id = store.add_entry(&tm, &source, target.as_deref(), string_id.as_deref())?;
            println!("added entry {id} to TM '{tm}'");
            Ok(())
        }
        Commands::Sync { tm } => run_sync(&data_dir, &db_path, &tm),
        Commands::Search {
            tm,
            query,
            top_k,
            threshold,
            check_target,
            npc_threshold,
        } => run_search(
            &data_dir,
            &tm,
            &query,
            top_k,
            threshold,
            check_target.as_deref(),
            npc_threshold,
        ),
        Commands::Engines => {
            for engine in embedder_registry::ENGINES {
                let marker = if engine.available { " " } else { "!" };
                println!(
                    "{marker} {:<6} {:<12} {:>5} dims  {}",
                    engine.info.name, engine.info.id, engine.info.dimension, engine.description
                );
            }
            Ok(())
        }
    }
}

fn run_sync(data_dir: &std::path::Path, db_path: &std::path::Path, tm: &str) -> Result<()> {
    let engine = embedder_registry::resolve_current()?;
    let store = EntryStore::open(db_path).context("opening entry store")?;
    let manager = TmSyncManager::new(data_dir.to_path_buf(), engine);

    let bar = ProgressBar::new(1);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{pos}/{len}] {msg}")
            .expect("static template is valid"),
    );
    let progress = |stage: &str, step: u64, total: u64| {
        bar.set_length(total);
        bar.set_position(step);
        bar.set_message(stage.to_string());
    };
    let report = manager.sync(tm, &store, Some(&progress))?;
    bar.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_search(
    data_dir: &std::path::Path,
    tm: &str,
    query: &str,
    top_k: usize,
    threshold: f32,
    check_target: Option<&str>,
    npc_threshold: f32,
) -> Result<()> {
    let indexer = TmIndexer::new(data_dir.to_path_buf(), embedder_registry::resolve_current()?);
    let bundle = indexer
        .load_indexes(tm)
        .with_context(|| format!("TM '{tm}' has no index bundle; run `tms sync --tm {tm}`"))?;

    // Queries must be embedded by the engine the bundle was built with, or
    // tier 2+ would compare vectors of different dimensionality.
    let engine = embedder_registry::resolve(&bundle.metadata.engine_name)?;
    let searcher = TmSearcher::new(
        engine,
        bundle.whole_lookup,
        bundle.line_lookup,
        bundle.whole,
        bundle.line,
    );

    match check_target {
        Some(target) => {
            let combined =
                searcher.search_with_npc(query, target, top_k, threshold, npc_threshold)?;
            println!("{}", serde_json::to_string_pretty(&combined)?);
        }
        None => {
            let response = searcher.search(query, top_k, threshold)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}
