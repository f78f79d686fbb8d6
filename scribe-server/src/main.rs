//! Scribe sync server binary.
//!
//! # Usage
//!
//! ```bash
//! # In-memory documents, plain-text engine
//! scribe-server --bind 127.0.0.1:9090 --auto-create
//!
//! # RocksDB-backed Yjs documents
//! scribe-server --storage-path ./scribe_data --engine yrs
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use log::{info, warn};
use tokio::net::TcpListener;
use uuid::Uuid;

use scribe_collab::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
use scribe_collab::{ServerConfig, SyncServer};
use scribe_core::{OperationEngine, TextEngine, YrsEngine};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Engine {
    /// JSON insert/delete operations over UTF-8 text
    Text,
    /// Yjs updates
    Yrs,
}

/// Scribe document sync server
#[derive(Parser, Debug)]
#[command(name = "scribe-server")]
#[command(about = "Collaborative document synchronization server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, env = "SCRIBE_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; documents are kept in memory when omitted
    #[arg(long, env = "SCRIBE_STORAGE_PATH")]
    storage_path: Option<PathBuf>,

    /// Operation engine for all documents
    #[arg(long, env = "SCRIBE_ENGINE", value_enum, default_value = "text")]
    engine: Engine,

    /// Maximum connections per document
    #[arg(long, env = "SCRIBE_MAX_PEERS", default_value = "100")]
    max_peers_per_room: usize,

    /// Commits buffered per room before slow connections lag
    #[arg(long, env = "SCRIBE_BROADCAST_CAPACITY", default_value = "256")]
    broadcast_capacity: usize,

    /// Create unknown documents on first join
    #[arg(long, env = "SCRIBE_AUTO_CREATE")]
    auto_create: bool,

    /// Create these documents at startup if they do not exist
    #[arg(long = "create", value_name = "DOCUMENT_ID")]
    create: Vec<Uuid>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, env = "SCRIBE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    info!("Scribe server starting");

    let engine: Arc<dyn OperationEngine> = match args.engine {
        Engine::Text => Arc::new(TextEngine::new()),
        Engine::Yrs => Arc::new(YrsEngine::new()),
    };

    let store: Arc<dyn DocumentStore> = match &args.storage_path {
        Some(path) => {
            let store = RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?;
            info!("Using RocksDB store at {}", path.display());
            Arc::new(store)
        }
        None => {
            warn!("No storage path given - documents live in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    for id in &args.create {
        match store.create_document(*id, engine.empty_document()).await {
            Ok(()) => info!("Created document {id}"),
            Err(StoreError::AlreadyExists(_)) => info!("Document {id} already exists"),
            Err(e) => return Err(e.into()),
        }
    }

    let config = ServerConfig {
        bind_addr: args.bind,
        max_peers_per_room: args.max_peers_per_room,
        broadcast_capacity: args.broadcast_capacity,
        auto_create_documents: args.auto_create,
        ..ServerConfig::default()
    };
    info!(
        "Engine: {}, auto-create: {}",
        engine.name(),
        config.auto_create_documents
    );

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let server = SyncServer::new(config, store, engine);
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    info!("Scribe server stopped");
    Ok(())
}
