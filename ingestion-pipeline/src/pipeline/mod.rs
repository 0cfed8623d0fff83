mod config;
mod context;
mod services;
mod stages;
mod state;
mod summary;

pub use config::{IngestionConfig, IngestionTuning};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};
pub use summary::{FileOutcome, RunSummary};

use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    storage::{
        archiver::Archiver,
        state_manager::StateManager,
        types::{FileRecord, FileStatus},
    },
    utils::{config::AppConfig, content_hash::hash_file, embedding::EmbeddingProvider},
};
use futures::{stream, StreamExt, TryStreamExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use self::{
    context::PipelineContext,
    stages::{chunk, embed, load, scan, STAGE_LOAD},
    state::ready,
};
use crate::{
    sinks::DatabaseLoader,
    utils::{
        file_scanner::{discover_files, DiscoveredFile},
        resource_gate::ResourceGate,
    },
};

/// Result of trying to take ownership of a content hash for this run.
enum Claim {
    /// Dropping the sender wakes every waiter.
    Owner(watch::Sender<()>),
    /// Another worker is driving this hash; resolves once it lets go.
    Waiter(watch::Receiver<()>),
}

/// Where a file enters the pipeline from.
enum FileSource {
    /// Found on disk during this run; the hash is computed from the bytes.
    Discovered(DiscoveredFile),
    /// Taken from the manifest by `resume`.
    Recorded(FileRecord),
}

#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    state: Arc<StateManager>,
    archiver: Arc<Archiver>,
    loader: Arc<DatabaseLoader>,
    pipeline_config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
    in_flight: Mutex<HashMap<String, watch::Receiver<()>>>,
}

impl IngestionPipeline {
    pub fn new(
        config: &AppConfig,
        state: Arc<StateManager>,
        archiver: Arc<Archiver>,
        loader: Arc<DatabaseLoader>,
        embedding_provider: Arc<EmbeddingProvider>,
    ) -> Result<Self, AppError> {
        let pipeline_config = IngestionConfig::from_app_config(config);
        let services = DefaultPipelineServices::new(
            &pipeline_config.tuning,
            ResourceGate::system(config.resource_limits.clone()),
            embedding_provider,
        )?;

        Self::with_services(state, archiver, loader, pipeline_config, Arc::new(services))
    }

    pub fn with_services(
        state: Arc<StateManager>,
        archiver: Arc<Archiver>,
        loader: Arc<DatabaseLoader>,
        pipeline_config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            state,
            archiver,
            loader,
            pipeline_config,
            services,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Full run over a file or directory. Per-file failures end up in the summary;
    /// only errors that stop all progress are returned.
    #[tracing::instrument(skip_all, fields(root = %root.display()))]
    pub async fn process_path(&self, root: &Path) -> Result<RunSummary, AppError> {
        let services = Arc::clone(&self.services);
        let files = discover_files(
            root,
            |path| services.supports(path),
            &self.pipeline_config.skip_dirs,
        )?;
        info!(files = files.len(), "discovered files");

        if files.is_empty() {
            return Ok(RunSummary::default());
        }

        self.services.health_check().await?;

        self.run_sources(files.into_iter().map(FileSource::Discovered).collect())
            .await
    }

    /// Drives a single file through the remaining stages.
    pub async fn process_file(&self, file: DiscoveredFile) -> Result<FileOutcome, AppError> {
        self.run_source(FileSource::Discovered(file)).await
    }

    /// Finishes files whose vectors are cached but not yet in the sinks: `EMBEDDED`
    /// records and `ERROR` records that failed while loading.
    #[tracing::instrument(skip_all)]
    pub async fn resume(&self) -> Result<RunSummary, AppError> {
        let mut pending = self.state.list(Some(FileStatus::Embedded)).await;
        pending.extend(
            self.state
                .list(Some(FileStatus::Error))
                .await
                .into_iter()
                .filter(|record| record.failed_stage() == Some(STAGE_LOAD)),
        );
        pending.sort_by(|a, b| a.hash.cmp(&b.hash));
        info!(files = pending.len(), "resuming files with cached vectors");

        self.run_sources(pending.into_iter().map(FileSource::Recorded).collect())
            .await
    }

    /// Resets records whose cached artifacts went missing so the next run rebuilds them.
    pub async fn recover(&self) -> Result<Vec<String>, AppError> {
        let recovered = self.state.recover(&self.archiver).await?;
        info!(recovered = recovered.len(), "manifest recovery finished");
        Ok(recovered)
    }

    async fn run_sources(&self, sources: Vec<FileSource>) -> Result<RunSummary, AppError> {
        let workers = self.pipeline_config.tuning.file_workers.max(1);
        let started = Instant::now();
        let mut summary = RunSummary::default();

        if workers == 1 {
            for source in sources {
                summary.push(self.run_source(source).await?);
            }
        } else {
            let outcomes: Vec<FileOutcome> = stream::iter(sources)
                .map(|source| self.run_source(source))
                .buffer_unordered(workers)
                .try_collect()
                .await?;
            for outcome in outcomes {
                summary.push(outcome);
            }
        }

        info!(
            files = summary.len(),
            workers,
            total_ms = Self::duration_millis(started.elapsed()),
            counts = ?summary.counts(),
            "ingestion run finished"
        );
        Ok(summary)
    }

    async fn claim(&self, hash: &str) -> Claim {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(receiver) = in_flight.get(hash) {
            return Claim::Waiter(receiver.clone());
        }
        let (sender, receiver) = watch::channel(());
        in_flight.insert(hash.to_owned(), receiver);
        Claim::Owner(sender)
    }

    async fn release(&self, hash: &str, owner: watch::Sender<()>) {
        self.in_flight.lock().await.remove(hash);
        drop(owner);
    }

    /// Waits for the worker that owns `hash` and reports the state it left behind,
    /// optionally pointing the record at `path` as the most recent location.
    async fn settle_duplicate(
        &self,
        hash: &str,
        mut waiter: watch::Receiver<()>,
        path: Option<String>,
    ) -> Result<FileOutcome, AppError> {
        // Only ever errors once the owner's sender is gone.
        let _ = waiter.changed().await;

        let record = match &path {
            Some(path) => Some(self.state.record_path(hash, path.clone()).await?),
            None => self.state.get(hash).await,
        };
        let Some(record) = record else {
            return Ok(FileOutcome::new(hash, path, FileStatus::Pending));
        };
        let path = path.or_else(|| record.path.clone());
        Ok(match (record.status, record.last_error) {
            (FileStatus::Error, Some(error)) => FileOutcome::failed(Some(hash), path, error),
            (status, _) => FileOutcome::new(hash, path, status),
        })
    }

    async fn run_source(&self, source: FileSource) -> Result<FileOutcome, AppError> {
        let (hash, owner, ctx) = match source {
            FileSource::Discovered(file) => {
                let path_label = file.path.display().to_string();
                let hash = match hash_file(&file.path).await {
                    Ok(hash) => hash,
                    Err(err) => {
                        warn!(path = %path_label, error = %err, "cannot identify file");
                        return Ok(FileOutcome::failed(None, Some(path_label), err.to_string()));
                    }
                };

                let owner = match self.claim(&hash).await {
                    Claim::Owner(owner) => owner,
                    Claim::Waiter(waiter) => {
                        info!(
                            file_hash = %hash,
                            path = %path_label,
                            "identical content already in flight; waiting to refresh path"
                        );
                        return self.settle_duplicate(&hash, waiter, Some(path_label)).await;
                    }
                };

                let record = self.state.get(&hash).await;
                let ctx = self
                    .context(hash.clone(), record.as_ref())
                    .with_source(file.path, file.mime_type);
                (hash, owner, ctx)
            }
            FileSource::Recorded(record) => {
                let owner = match self.claim(&record.hash).await {
                    Claim::Owner(owner) => owner,
                    Claim::Waiter(waiter) => {
                        return self.settle_duplicate(&record.hash, waiter, None).await;
                    }
                };
                let ctx = self.context(record.hash.clone(), Some(&record));
                (record.hash.clone(), owner, ctx)
            }
        };

        let outcome = self.run_file(ctx).await;
        self.release(&hash, owner).await;
        outcome
    }

    fn context<'a>(&'a self, hash: String, record: Option<&FileRecord>) -> PipelineContext<'a> {
        PipelineContext::new(
            hash,
            record,
            self.services.as_ref(),
            self.state.as_ref(),
            self.archiver.as_ref(),
            self.loader.as_ref(),
        )
    }

    #[tracing::instrument(skip_all, fields(file_hash = %ctx.file_hash, status = %ctx.status))]
    async fn run_file(&self, mut ctx: PipelineContext<'_>) -> Result<FileOutcome, AppError> {
        if ctx.status == FileStatus::Loaded {
            if let Some(path) = ctx.verified_path() {
                self.state
                    .record(&ctx.file_hash, FileStatus::Loaded, Some(path), None)
                    .await?;
            }
            debug!(file_hash = %ctx.file_hash, "already loaded; skipping");
            return Ok(FileOutcome::new(
                &ctx.file_hash,
                ctx.path_label(),
                FileStatus::Loaded,
            ));
        }

        let started = Instant::now();
        match Self::drive(&mut ctx).await {
            Ok(()) => {
                info!(
                    file_hash = %ctx.file_hash,
                    path = ?ctx.path,
                    total_ms = Self::duration_millis(started.elapsed()),
                    "file ingested"
                );
                Ok(FileOutcome::new(
                    &ctx.file_hash,
                    ctx.path_label(),
                    ctx.status,
                ))
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                let message = err.to_string();
                self.state
                    .record_error(&ctx.file_hash, ctx.stage, &message, ctx.verified_path())
                    .await?;
                warn!(
                    file_hash = %ctx.file_hash,
                    stage = ctx.stage,
                    kind = err.kind().as_str(),
                    "file recorded as ERROR; continuing with next file"
                );
                Ok(FileOutcome::failed(
                    Some(&ctx.file_hash),
                    ctx.path_label(),
                    message,
                ))
            }
        }
    }

    async fn drive(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        let machine = ready();
        let machine = scan(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let machine = chunk(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let machine = embed(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        let _machine = load(machine, ctx).await.map_err(|err| ctx.abort(err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
