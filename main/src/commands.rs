use std::sync::Arc;

use anyhow::{Context, Result};
use common::{
    storage::{
        archiver::Archiver, state_manager::StateManager, store::StorageManager,
        types::FileRecord,
    },
    utils::{
        config::{load_config, AppConfig},
        content_hash::short_hash,
        embedding::EmbeddingProvider,
    },
};
use ingestion_pipeline::{
    DatabaseLoader, IngestionPipeline, RunSummary, SinkContext, SinkRegistry,
};
use tracing::{info, warn};

use crate::args::{CacheAction, Cli, Command, ResetArgs, StatusArgs};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FILE_ERRORS: u8 = 1;

struct Workspace {
    config: AppConfig,
    storage: StorageManager,
    state: Arc<StateManager>,
    archiver: Arc<Archiver>,
}

impl Workspace {
    async fn open(config: AppConfig) -> Result<Self> {
        let storage = StorageManager::local(&config.cache.directory)
            .await
            .with_context(|| {
                format!(
                    "failed to open cache directory {}",
                    config.cache.directory.display()
                )
            })?;
        let state = Arc::new(StateManager::open_file(&config.manifest_path())?);
        let archiver = Arc::new(Archiver::new(storage.clone(), &config.cache));
        Ok(Self {
            config,
            storage,
            state,
            archiver,
        })
    }

    async fn pipeline(&self) -> Result<(IngestionPipeline, Arc<DatabaseLoader>)> {
        let embedding_provider =
            Arc::new(EmbeddingProvider::from_config(&self.config.embedding).await?);
        info!(
            backend = embedding_provider.backend_label(),
            model = ?embedding_provider.model_code(),
            dimension = embedding_provider.dimension(),
            "embedding provider initialized"
        );

        let ctx = SinkContext {
            storage: self.storage.clone(),
        };
        let loader = Arc::new(
            DatabaseLoader::connect(&self.config.databases, &SinkRegistry::with_defaults(), &ctx)
                .await,
        );
        if loader.active_sinks().is_empty() {
            warn!("no vector sink connected; files will stop at EMBEDDED until one is available");
        }

        let pipeline = IngestionPipeline::new(
            &self.config,
            Arc::clone(&self.state),
            Arc::clone(&self.archiver),
            Arc::clone(&loader),
            embedding_provider,
        )?;
        Ok((pipeline, loader))
    }
}

pub async fn run(cli: Cli) -> Result<u8> {
    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(cache_dir) = cli.cache_dir {
        config.cache.directory = cache_dir;
    }
    if let Command::Process(args) = &cli.command {
        args.apply(&mut config);
    }
    config.validate()?;

    let workspace = Workspace::open(config).await?;

    match cli.command {
        Command::Process(args) => {
            let (pipeline, loader) = workspace.pipeline().await?;
            let summary = pipeline.process_path(&args.path).await;
            loader.close().await;
            let summary = summary?;
            print_summary(&summary);
            Ok(exit_code(&summary))
        }
        Command::Resume => {
            let (pipeline, loader) = workspace.pipeline().await?;
            let summary = pipeline.resume().await;
            loader.close().await;
            let summary = summary?;
            print_summary(&summary);
            Ok(exit_code(&summary))
        }
        Command::Status(args) => status(&workspace, args).await,
        Command::Reset(args) => reset(&workspace, args).await,
        Command::Recover => {
            let recovered = workspace.state.recover(&workspace.archiver).await?;
            if recovered.is_empty() {
                println!("manifest is consistent with the cache");
            }
            for hash in &recovered {
                println!("reset {hash}");
            }
            Ok(EXIT_OK)
        }
        Command::Cache { action } => cache(&workspace, action).await,
    }
}

fn exit_code(summary: &RunSummary) -> u8 {
    if summary.has_errors() {
        EXIT_FILE_ERRORS
    } else {
        EXIT_OK
    }
}

fn print_summary(summary: &RunSummary) {
    for outcome in &summary.outcomes {
        let hash = outcome.hash.as_deref().map_or("-", short_hash);
        let path = outcome.path.as_deref().unwrap_or("-");
        match &outcome.error {
            Some(error) => println!("{:<9} {hash:<8} {path}  ({error})", outcome.status),
            None => println!("{:<9} {hash:<8} {path}", outcome.status),
        }
    }
    let counts: Vec<String> = summary
        .counts()
        .into_iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect();
    println!("{} file(s): {}", summary.len(), counts.join(" "));
}

fn print_record(record: &FileRecord) {
    let path = record.path.as_deref().unwrap_or("-");
    match &record.last_error {
        Some(error) => println!(
            "{:<9} {} {path}  errors={} ({error})",
            record.status, record.hash, record.error_count
        ),
        None => println!("{:<9} {} {path}", record.status, record.hash),
    }
}

async fn status(workspace: &Workspace, args: StatusArgs) -> Result<u8> {
    if let Some(hash) = args.hash {
        let record = workspace
            .state
            .get(&hash)
            .await
            .with_context(|| format!("no manifest record for {hash}"))?;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(EXIT_OK);
    }

    let mut records = workspace.state.list(args.status).await;
    records.sort_by(|a, b| a.path.cmp(&b.path));
    for record in &records {
        print_record(record);
    }

    let stats = workspace.state.stats().await;
    let counts: Vec<String> = stats
        .by_status
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(status, count)| format!("{status}={count}"))
        .collect();
    println!(
        "{} file(s): {}; {} failure(s) across {} file(s)",
        stats.total_files,
        counts.join(" "),
        stats.total_errors,
        stats.files_with_errors
    );
    Ok(EXIT_OK)
}

async fn reset(workspace: &Workspace, args: ResetArgs) -> Result<u8> {
    let hashes: Vec<String> = match args.hash {
        Some(hash) => vec![hash],
        None => workspace
            .state
            .error_files(args.min_errors)
            .await
            .into_iter()
            .map(|record| record.hash)
            .collect(),
    };

    for hash in &hashes {
        workspace.state.reset(hash).await?;
        println!("reset {hash}");
    }
    if hashes.is_empty() {
        println!("nothing to reset");
    }
    Ok(EXIT_OK)
}

async fn cache(workspace: &Workspace, action: CacheAction) -> Result<u8> {
    let archiver = &workspace.archiver;
    match action {
        CacheAction::Stats => {
            let stats = archiver.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        CacheAction::Cleanup => {
            let removed = archiver.cleanup_corrupted().await?;
            println!("removed corrupt artifacts for {} file(s)", removed.len());
        }
        CacheAction::Evict => {
            let evicted = archiver.enforce_limits().await?;
            println!("evicted {} file(s)", evicted.len());
        }
        CacheAction::Clear => {
            archiver.clear().await?;
            println!("cache cleared");
        }
    }
    Ok(EXIT_OK)
}
