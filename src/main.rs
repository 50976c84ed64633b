use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod config;
mod lock;
mod notes;
mod semantic;
mod watch;

use config::{Backend, Config};
use lock::IndexLock;
use notes::FsDocumentStore;
use semantic::{
    ChangeWatcherAdapter, Embedder, EmbeddingService, EmbeddingStorage, EventBus, IndexEvent,
    IndexStats, OllamaClient, Subscription, VectorIndex,
};

fn main() -> anyhow::Result<()> {
    init_logging();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting noteindex");

    let args = cli::Args::parse();

    let base_path = match args.base_path {
        Some(path) => path,
        None => config::default_base_path()?,
    };
    let config = Config::load_with(&base_path)?;

    match args.command {
        cli::Command::Stats {} => print_stats(&base_path),

        cli::Command::Clear {} => {
            let _lock = IndexLock::try_acquire(&base_path)?;
            EmbeddingStorage::in_dir(&base_path).delete()?;
            println!("embedding cache cleared");
            Ok(())
        }

        cli::Command::Index { force } => {
            let _lock = IndexLock::try_acquire(&base_path)?;
            let had_cache = EmbeddingStorage::in_dir(&base_path).exists();
            let (mut service, _store, _progress) = build_service(&config, &args.notes)?;
            let running = Arc::new(AtomicBool::new(true));
            watch::install_shutdown_handler(running, service.cancel_handle())?;

            service.initialize()?;
            if force && had_cache {
                let summary = service.rebuild()?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let summary = service.sync()?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }

            service.flush()?;
            Ok(())
        }

        cli::Command::Search {
            query,
            limit,
            min_similarity,
        } => {
            if let Some(min) = min_similarity {
                if !(-1.0..=1.0).contains(&min) {
                    bail!("--min-similarity must be between -1.0 and 1.0");
                }
            }

            let _lock = IndexLock::try_acquire(&base_path)?;
            let (mut service, _store, _progress) = build_service(&config, &args.notes)?;
            service.initialize()?;

            let hits = service.search(&query, limit, min_similarity)?;
            service.flush()?;

            println!("{}", serde_json::to_string_pretty(&hits)?);
            Ok(())
        }

        cli::Command::Watch {} => {
            let lock = IndexLock::try_acquire(&base_path)?;
            log::info!("holding {} until shutdown", lock.path().display());
            let (mut service, store, _progress) = build_service(&config, &args.notes)?;

            let running = Arc::new(AtomicBool::new(true));
            watch::install_shutdown_handler(running.clone(), service.cancel_handle())?;

            service.initialize()?;
            let mut adapter = ChangeWatcherAdapter::new(
                config.modify_debounce(),
                Arc::new(semantic::clock::SystemClock),
            );
            let result = watch::run(&mut service, &mut adapter, &store, &running);

            service.cleanup();
            result
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_embedder(config: &Config) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.backend {
        Backend::Ollama => Ok(Arc::new(OllamaClient::new(
            &config.ollama_base_url,
            config.ollama_auth_token.clone(),
            config.request_timeout(),
        )?)),
        #[cfg(feature = "local-embeddings")]
        Backend::Local => Ok(Arc::new(semantic::LocalEmbedder::new(
            &config.embedding_model,
            config.models_dir(),
        )?)),
        #[cfg(not(feature = "local-embeddings"))]
        Backend::Local => bail!("this build has no local embedding support"),
    }
}

fn build_service(
    config: &Config,
    notes_dir: &Path,
) -> anyhow::Result<(EmbeddingService, Arc<FsDocumentStore>, Subscription)> {
    let root = notes_dir
        .canonicalize()
        .with_context(|| format!("notes directory {} not found", notes_dir.display()))?;
    let store = Arc::new(FsDocumentStore::new(root));

    let bus = EventBus::new();
    let progress = attach_progress_bar(&bus);

    let service = EmbeddingService::new(
        config.service_config(),
        build_embedder(config)?,
        store.clone(),
        EmbeddingStorage::in_dir(config.base_path()),
        bus,
    );

    Ok((service, store, progress))
}

/// Render batch progress on stderr.
fn attach_progress_bar(bus: &Arc<EventBus>) -> Subscription {
    let bar: Mutex<Option<ProgressBar>> = Mutex::new(None);

    bus.subscribe(move |event| {
        let Ok(mut bar) = bar.lock() else {
            return;
        };

        match event {
            IndexEvent::GenerationStarted { progress, .. } if progress.total > 0 => {
                let pb = ProgressBar::new(progress.total as u64);
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("[{bar:40.cyan/blue}] {pos}/{len} notes | {msg}")
                {
                    pb.set_style(style.progress_chars("##."));
                }
                *bar = Some(pb);
            }
            IndexEvent::StatsUpdated { progress, .. } if progress.is_running => {
                if let Some(pb) = bar.as_ref() {
                    pb.set_position(progress.processed as u64);
                }
            }
            IndexEvent::FileProcessed { path, .. } => {
                if let Some(pb) = bar.as_ref() {
                    pb.set_message(path.clone());
                }
            }
            IndexEvent::GenerationCompleted { .. } => {
                if let Some(pb) = bar.take() {
                    pb.finish_and_clear();
                }
            }
            IndexEvent::GenerationError { error, .. } => {
                if let Some(pb) = bar.take() {
                    pb.abandon_with_message(error.clone());
                }
            }
            _ => {}
        }
    })
}

/// Print statistics of the persisted cache without loading any model.
fn print_stats(base_path: &Path) -> anyhow::Result<()> {
    let Some(snapshot) = EmbeddingStorage::in_dir(base_path).inspect()? else {
        println!("no embedding cache in {}", base_path.display());
        return Ok(());
    };

    let mut index = VectorIndex::with_dimensions(snapshot.model_dimensions);
    for record in snapshot.records {
        let key = record.key.clone();
        if let Err(e) = index.insert(record) {
            log::warn!("skipping cached embedding {key}: {e}");
        }
    }

    let report = serde_json::json!({
        "version": snapshot.version,
        "model": snapshot.model_name,
        "createdAt": snapshot.created_at,
        "updatedAt": snapshot.updated_at,
        "stats": IndexStats::from_index(&index),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
