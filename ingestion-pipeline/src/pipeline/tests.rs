use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        archiver::Archiver,
        manifest::InMemoryManifestStore,
        state_manager::StateManager,
        store::StorageManager,
        types::{FileStatus, TextChunk, VectorBatch},
    },
    utils::{config::CacheConfig, content_hash::hash_bytes, embedding::EmbeddingProvider},
};
use tempfile::TempDir;
use tokio::sync::Mutex;

use super::{
    config::{IngestionConfig, IngestionTuning},
    services::PipelineServices,
    IngestionPipeline,
};
use crate::{
    sinks::{DatabaseLoader, MemorySink, VectorSink},
    utils::chunking::Chunker,
};

const DIMENSION: usize = 8;
const SAMPLE: &str = "hello world. This is ELESS.";

struct MockServices {
    chunker: Chunker,
    embedder: EmbeddingProvider,
    fail_extract_for: Option<&'static str>,
    model_down: bool,
    /// Backend stops answering once this many embed calls went through.
    offline_after_embeds: Option<usize>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockServices {
    fn new() -> Self {
        Self {
            chunker: Chunker::new(15, 0).expect("chunker"),
            embedder: EmbeddingProvider::new_hashed(DIMENSION),
            fail_extract_for: None,
            model_down: false,
            offline_after_embeds: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(file_name: &'static str) -> Self {
        Self {
            fail_extract_for: Some(file_name),
            ..Self::new()
        }
    }

    fn offline() -> Self {
        Self {
            model_down: true,
            ..Self::new()
        }
    }

    fn going_offline_after(embeds: usize) -> Self {
        Self {
            offline_after_embeds: Some(embeds),
            ..Self::new()
        }
    }

    async fn went_offline(&self) -> bool {
        match self.offline_after_embeds {
            Some(limit) => self.count("embed").await > limit,
            None => false,
        }
    }

    async fn record(&self, stage: &'static str) {
        self.calls.lock().await.push(stage);
    }

    async fn count(&self, stage: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| **call == stage)
            .count()
    }
}

#[async_trait]
impl PipelineServices for MockServices {
    fn supports(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "txt")
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.record("health").await;
        if self.model_down || self.went_offline().await {
            return Err(AppError::ModelUnavailable("mock backend offline".into()));
        }
        Ok(())
    }

    async fn extract(&self, path: &Path, _mime_type: &str) -> Result<String, AppError> {
        self.record("extract").await;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if self.fail_extract_for == Some(name) {
            return Err(AppError::Extraction(format!("mock cannot parse {name}")));
        }
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn chunk(
        &self,
        file_hash: &str,
        text: &str,
        mime_type: &str,
        path: Option<&str>,
    ) -> Result<Vec<TextChunk>, AppError> {
        self.record("chunk").await;
        self.chunker.chunk(file_hash, text, mime_type, path)
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        self.record("embed").await;
        if self.went_offline().await {
            return Err(AppError::Model("mock backend refused the connection".into()));
        }
        self.embedder
            .embed_batch(texts)
            .await
            .map_err(|err| AppError::Model(err.to_string()))
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<InMemoryManifestStore>,
    state: Arc<StateManager>,
    archiver: Arc<Archiver>,
    sink: Arc<MemorySink>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryManifestStore::new());
        let state = Arc::new(StateManager::open(store.clone()).expect("manifest"));
        let archiver = Arc::new(Archiver::new(
            StorageManager::memory(),
            &CacheConfig::default(),
        ));
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            store,
            state,
            archiver,
            sink: Arc::new(MemorySink::new("memory")),
        }
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("write input");
        path
    }

    fn loader(&self, sinks: Vec<Arc<dyn VectorSink>>) -> Arc<DatabaseLoader> {
        Arc::new(DatabaseLoader::with_sinks(
            sinks,
            16,
            Duration::from_secs(5),
            0,
        ))
    }

    fn pipeline_with(
        &self,
        services: Arc<MockServices>,
        loader: Arc<DatabaseLoader>,
        workers: usize,
    ) -> IngestionPipeline {
        let config = IngestionConfig {
            tuning: IngestionTuning {
                chunk_size: 15,
                chunk_overlap: 0,
                file_workers: workers,
                ..IngestionTuning::default()
            },
            skip_dirs: Vec::new(),
        };
        IngestionPipeline::with_services(
            Arc::clone(&self.state),
            Arc::clone(&self.archiver),
            loader,
            config,
            services,
        )
        .expect("pipeline")
    }

    fn pipeline(&self, services: Arc<MockServices>) -> IngestionPipeline {
        let loader = self.loader(vec![self.sink.clone()]);
        self.pipeline_with(services, loader, 1)
    }

    /// Seeds an `EMBEDDED` record with cached chunks and vectors for `content`.
    async fn seed_embedded(&self, path: &Path, content: &str, with_cache: bool) -> String {
        let hash = hash_bytes(content.as_bytes());
        let label = path.display().to_string();
        for status in [FileStatus::Scanned, FileStatus::Chunked, FileStatus::Embedded] {
            self.state
                .record(&hash, status, Some(label.clone()), None)
                .await
                .expect("seed record");
        }
        if with_cache {
            let chunks = Chunker::new(15, 0)
                .expect("chunker")
                .chunk(&hash, content, "text/plain", Some(&label))
                .expect("chunks");
            let rows = EmbeddingProvider::new_hashed(DIMENSION)
                .embed_batch(chunks.iter().map(|c| c.text.clone()).collect())
                .await
                .expect("embed");
            let vectors = VectorBatch::from_rows(rows, DIMENSION).expect("vectors");
            self.archiver
                .save_chunks(&hash, &chunks)
                .await
                .expect("save chunks");
            self.archiver
                .save_vectors(&hash, &vectors)
                .await
                .expect("save vectors");
        }
        hash
    }
}

#[tokio::test]
async fn single_text_file_reaches_loaded_with_two_chunks() {
    let harness = Harness::new();
    let path = harness.write("hello.txt", SAMPLE);
    let services = Arc::new(MockServices::new());
    let pipeline = harness.pipeline(services.clone());

    let summary = pipeline
        .process_path(harness.dir.path())
        .await
        .expect("run");

    let hash = hash_bytes(SAMPLE.as_bytes());
    assert_eq!(summary.len(), 1);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(
        summary.outcome_for(&hash).map(|o| o.status),
        Some(FileStatus::Loaded)
    );

    let record = harness.state.get(&hash).await.expect("record");
    assert_eq!(record.status, FileStatus::Loaded);
    assert_eq!(record.path, Some(path.display().to_string()));
    assert_eq!(record.chunk_count(), Some(2));

    let chunks = harness
        .archiver
        .load_chunks(&hash)
        .await
        .expect("load chunks")
        .expect("chunks cached");
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["hello world.", "This is ELESS."]);

    let vectors = harness
        .archiver
        .load_vectors(&hash)
        .await
        .expect("load vectors")
        .expect("vectors cached");
    assert_eq!(vectors.rows(), 2);
    assert_eq!(vectors.dimension(), DIMENSION);

    assert_eq!(harness.sink.batch_sizes().await, vec![2]);
    assert!(harness.sink.get(&format!("{hash}:1")).await.is_some());
    assert_eq!(services.count("health").await, 1);
}

#[tokio::test]
async fn resume_loads_embedded_files_without_embedding_again() {
    let harness = Harness::new();
    let path = harness.write("hello.txt", SAMPLE);
    let hash = harness.seed_embedded(&path, SAMPLE, true).await;
    let services = Arc::new(MockServices::new());
    let pipeline = harness.pipeline(services.clone());

    let summary = pipeline.resume().await.expect("resume");

    assert_eq!(summary.len(), 1);
    assert_eq!(harness.state.get_status(&hash).await, FileStatus::Loaded);
    assert_eq!(services.count("embed").await, 0);
    assert_eq!(services.count("extract").await, 0);
    assert_eq!(harness.sink.len().await, 2);
}

#[tokio::test]
async fn resume_retries_files_that_failed_while_loading() {
    let harness = Harness::new();
    harness.write("hello.txt", SAMPLE);
    let services = Arc::new(MockServices::new());

    let offline = harness.pipeline_with(services.clone(), harness.loader(Vec::new()), 1);
    let first = offline
        .process_path(harness.dir.path())
        .await
        .expect("first run");
    assert_eq!(first.exit_code(), 1);

    let hash = hash_bytes(SAMPLE.as_bytes());
    let failed = harness.state.get(&hash).await.expect("record");
    assert_eq!(failed.status, FileStatus::Error);
    assert_eq!(failed.failed_stage(), Some("load"));
    assert_eq!(failed.error_count, 1);

    let online = harness.pipeline(services.clone());
    let resumed = online.resume().await.expect("resume");

    assert_eq!(resumed.exit_code(), 0);
    let record = harness.state.get(&hash).await.expect("record");
    assert_eq!(record.status, FileStatus::Loaded);
    assert_eq!(record.error_count, 0);
    assert!(record.last_error.is_none());
    assert_eq!(services.count("embed").await, 1);
    assert_eq!(services.count("extract").await, 1);
}

#[tokio::test]
async fn one_failing_file_does_not_stop_the_others() {
    let harness = Harness::new();
    let first = harness.write("a.txt", "first document. It has text.");
    let second = harness.write("b.txt", "second document. Broken one.");
    let third = harness.write("c.txt", "third document. Also fine.");
    let services = Arc::new(MockServices::failing_on("b.txt"));
    let pipeline = harness.pipeline(services.clone());

    let summary = pipeline
        .process_path(harness.dir.path())
        .await
        .expect("run");

    let statuses: Vec<(Option<String>, FileStatus)> = summary
        .outcomes
        .iter()
        .map(|o| (o.path.clone(), o.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (Some(first.display().to_string()), FileStatus::Loaded),
            (Some(second.display().to_string()), FileStatus::Error),
            (Some(third.display().to_string()), FileStatus::Loaded),
        ]
    );
    assert_eq!(summary.exit_code(), 1);

    let broken = harness
        .state
        .get(&hash_bytes(b"second document. Broken one."))
        .await
        .expect("record");
    assert_eq!(broken.status, FileStatus::Error);
    assert_eq!(broken.failed_stage(), Some("chunk"));
    assert_eq!(broken.path, Some(second.display().to_string()));
    assert!(broken
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("mock cannot parse")));
    assert_eq!(services.count("extract").await, 3);
}

#[tokio::test]
async fn second_run_skips_completed_work() {
    let harness = Harness::new();
    harness.write("hello.txt", SAMPLE);
    let services = Arc::new(MockServices::new());
    let pipeline = harness.pipeline(services.clone());

    pipeline
        .process_path(harness.dir.path())
        .await
        .expect("first run");
    let second = pipeline
        .process_path(harness.dir.path())
        .await
        .expect("second run");

    assert_eq!(second.counts().get("LOADED"), Some(&1));
    assert_eq!(services.count("extract").await, 1);
    assert_eq!(services.count("embed").await, 1);
    assert_eq!(harness.state.list(None).await.len(), 1);
    assert_eq!(harness.sink.batch_sizes().await, vec![2]);
}

#[tokio::test]
async fn identical_content_keeps_one_record_with_latest_path() {
    let harness = Harness::new();
    harness.write("a.txt", SAMPLE);
    let copy = harness.write("copy.txt", SAMPLE);
    let services = Arc::new(MockServices::new());
    let pipeline = harness.pipeline(services.clone());

    let summary = pipeline
        .process_path(harness.dir.path())
        .await
        .expect("run");

    assert_eq!(summary.len(), 2);
    let records = harness.state.list(None).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].path, Some(copy.display().to_string()));
    assert_eq!(services.count("embed").await, 1);
}

#[tokio::test]
async fn identical_content_under_parallel_workers_reports_final_status() {
    let harness = Harness::new();
    let paths: Vec<String> = ["a.txt", "b.txt", "copy.txt"]
        .into_iter()
        .map(|name| harness.write(name, SAMPLE).display().to_string())
        .collect();
    let services = Arc::new(MockServices::new());
    let loader = harness.loader(vec![harness.sink.clone()]);
    let pipeline = harness.pipeline_with(services.clone(), loader, 4);

    let summary = pipeline
        .process_path(harness.dir.path())
        .await
        .expect("run");

    assert_eq!(summary.len(), 3);
    assert_eq!(summary.counts().get("LOADED"), Some(&3));
    let records = harness.state.list(None).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, FileStatus::Loaded);
    assert!(records[0]
        .path
        .as_ref()
        .is_some_and(|path| paths.contains(path)));
    assert_eq!(services.count("embed").await, 1);
    assert_eq!(harness.sink.len().await, 2);
}

#[tokio::test]
async fn embedder_going_offline_mid_run_stops_the_run() {
    let harness = Harness::new();
    let first = harness.write("a.txt", "first document. It has text.");
    let second = harness.write("b.txt", "second document. Never embedded.");
    let third = harness.write("c.txt", "third document. Never reached.");
    let services = Arc::new(MockServices::going_offline_after(1));
    let pipeline = harness.pipeline(services.clone());

    let result = pipeline.process_path(harness.dir.path()).await;

    assert!(matches!(result, Err(AppError::ModelUnavailable(_))));
    let read = |path: &PathBuf| std::fs::read(path).expect("read input");
    assert_eq!(
        harness.state.get_status(&hash_bytes(&read(&first))).await,
        FileStatus::Loaded
    );
    let stalled = harness
        .state
        .get(&hash_bytes(&read(&second)))
        .await
        .expect("record");
    assert_eq!(stalled.status, FileStatus::Chunked);
    assert_eq!(stalled.error_count, 0);
    assert!(harness
        .state
        .get(&hash_bytes(&read(&third)))
        .await
        .is_none());
    assert_eq!(services.count("embed").await, 2);
}

#[tokio::test]
async fn unavailable_embedder_aborts_before_touching_files() {
    let harness = Harness::new();
    harness.write("hello.txt", SAMPLE);
    let services = Arc::new(MockServices::offline());
    let pipeline = harness.pipeline(services.clone());

    let result = pipeline.process_path(harness.dir.path()).await;

    assert!(matches!(result, Err(AppError::ModelUnavailable(_))));
    assert!(harness.state.list(None).await.is_empty());
    assert_eq!(services.count("extract").await, 0);
}

#[tokio::test]
async fn manifest_write_failure_aborts_the_run() {
    let harness = Harness::new();
    harness.write("a.txt", SAMPLE);
    harness.write("b.txt", "another file. With text.");
    let services = Arc::new(MockServices::new());
    let pipeline = harness.pipeline(services.clone());
    harness.store.set_fail_commits(true);

    let result = pipeline.process_path(harness.dir.path()).await;

    assert!(matches!(result, Err(AppError::Manifest(_))));
    assert!(harness.state.list(None).await.is_empty());
    assert_eq!(services.count("extract").await, 0);
}

#[tokio::test]
async fn resume_rebuilds_missing_vectors_from_the_stored_path() {
    let harness = Harness::new();
    let path = harness.write("hello.txt", SAMPLE);
    let hash = harness.seed_embedded(&path, SAMPLE, false).await;
    let services = Arc::new(MockServices::new());
    let pipeline = harness.pipeline(services.clone());

    let summary = pipeline.resume().await.expect("resume");

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(harness.state.get_status(&hash).await, FileStatus::Loaded);
    assert_eq!(services.count("extract").await, 1);
    assert_eq!(services.count("embed").await, 1);
    assert!(harness
        .archiver
        .load_vectors(&hash)
        .await
        .expect("load")
        .is_some());
}

#[tokio::test]
async fn rebuilt_artifacts_refresh_counts_in_the_manifest() {
    let harness = Harness::new();
    let path = harness.write("hello.txt", SAMPLE);
    let hash = harness.seed_embedded(&path, SAMPLE, false).await;
    let stale = serde_json::Map::from_iter([
        ("chunk_count".to_string(), serde_json::json!(7)),
        ("vector_count".to_string(), serde_json::json!(7)),
    ]);
    harness
        .state
        .record(&hash, FileStatus::Embedded, None, Some(stale))
        .await
        .expect("stale counts");
    let pipeline = harness.pipeline_with(
        Arc::new(MockServices::new()),
        harness.loader(Vec::new()),
        1,
    );

    pipeline.resume().await.expect("resume");

    let record = harness.state.get(&hash).await.expect("record");
    assert_eq!(record.failed_stage(), Some("load"));
    assert_eq!(record.chunk_count(), Some(2));
    assert_eq!(record.vector_count(), Some(2));
}

#[tokio::test]
async fn resume_refuses_a_path_whose_content_changed() {
    let harness = Harness::new();
    let path = harness.write("hello.txt", SAMPLE);
    let hash = harness.seed_embedded(&path, SAMPLE, false).await;
    std::fs::write(&path, "rewritten since the last run").expect("rewrite");
    let services = Arc::new(MockServices::new());
    let pipeline = harness.pipeline(services.clone());

    let summary = pipeline.resume().await.expect("resume");

    assert_eq!(summary.exit_code(), 1);
    let record = harness.state.get(&hash).await.expect("record");
    assert_eq!(record.status, FileStatus::Error);
    assert_eq!(record.path, Some(path.display().to_string()));
    assert_eq!(services.count("extract").await, 0);
}

#[tokio::test]
async fn parallel_workers_process_every_file_once() {
    let harness = Harness::new();
    for index in 0..6 {
        harness.write(
            &format!("doc{index}.txt"),
            &format!("document {index}. Some more words."),
        );
    }
    let services = Arc::new(MockServices::new());
    let loader = harness.loader(vec![harness.sink.clone()]);
    let pipeline = harness.pipeline_with(services.clone(), loader, 4);

    let summary = pipeline
        .process_path(harness.dir.path())
        .await
        .expect("run");

    assert_eq!(summary.len(), 6);
    assert_eq!(summary.counts().get("LOADED"), Some(&6));
    assert_eq!(harness.state.list(Some(FileStatus::Loaded)).await.len(), 6);
    assert_eq!(services.count("embed").await, 6);
}

#[tokio::test]
async fn recover_resets_records_with_missing_artifacts() {
    let harness = Harness::new();
    let path = harness.write("hello.txt", SAMPLE);
    let hash = harness.seed_embedded(&path, SAMPLE, false).await;
    let pipeline = harness.pipeline(Arc::new(MockServices::new()));

    let recovered = pipeline.recover().await.expect("recover");

    assert_eq!(recovered, vec![hash.clone()]);
    assert_eq!(harness.state.get_status(&hash).await, FileStatus::Pending);
}
