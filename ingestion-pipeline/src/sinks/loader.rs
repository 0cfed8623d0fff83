use std::{sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::types::{TextChunk, VectorBatch},
    utils::config::DatabaseConfig,
};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, error, info, warn};

use super::{SinkContext, SinkRegistry, VectorRecord, VectorSink};

/// Fans vectors out to every connected sink in fixed-size batches.
pub struct DatabaseLoader {
    sinks: Vec<Arc<dyn VectorSink>>,
    batch_size: usize,
    timeout: Duration,
    retry_attempts: usize,
}

impl DatabaseLoader {
    /// Builds and connects every configured target. Targets that fail are logged and left
    /// out; an empty result is only an error once something is loaded.
    pub async fn connect(
        config: &DatabaseConfig,
        registry: &SinkRegistry,
        ctx: &SinkContext,
    ) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut sinks = Vec::new();
        for target in &config.targets {
            let Some(connection) = config.connections.get(target) else {
                warn!(target = %target, "no connection configured for target; skipping");
                continue;
            };
            let sink = match registry.build(target, connection, ctx) {
                Ok(sink) => sink,
                Err(err) => {
                    error!(target = %target, error = %err, "failed to build vector sink");
                    continue;
                }
            };
            match tokio::time::timeout(timeout, sink.connect()).await {
                Ok(Ok(())) => {
                    info!(target = %target, kind = connection.type_key(), "vector sink connected");
                    sinks.push(sink);
                }
                Ok(Err(err)) => error!(target = %target, error = %err, "failed to connect vector sink"),
                Err(_) => error!(target = %target, timeout = ?timeout, "vector sink connect timed out"),
            }
        }

        Self::with_sinks(sinks, config.batch_size, timeout, config.retry_attempts)
    }

    pub fn with_sinks(
        sinks: Vec<Arc<dyn VectorSink>>,
        batch_size: usize,
        timeout: Duration,
        retry_attempts: usize,
    ) -> Self {
        Self {
            sinks,
            batch_size: batch_size.max(1),
            timeout,
            retry_attempts,
        }
    }

    pub fn active_sinks(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Upserts one file's vectors into every sink. Fails if any sink rejects a batch
    /// after retries, leaving the file eligible for a later resume.
    pub async fn load(&self, chunks: &[TextChunk], vectors: &VectorBatch) -> Result<usize, AppError> {
        if self.sinks.is_empty() {
            return Err(AppError::Sink("no vector sinks are connected".into()));
        }
        if chunks.len() != vectors.rows() {
            return Err(AppError::Sink(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.rows()
            )));
        }

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors.iter_rows())
            .map(|(chunk, row)| VectorRecord::from_chunk(chunk, row))
            .collect();

        for sink in &self.sinks {
            for batch in records.chunks(self.batch_size) {
                self.upsert_with_retry(sink.as_ref(), batch).await?;
            }
            debug!(sink = sink.name(), records = records.len(), "loaded vectors");
        }
        Ok(records.len())
    }

    async fn upsert_with_retry(
        &self,
        sink: &dyn VectorSink,
        batch: &[VectorRecord],
    ) -> Result<(), AppError> {
        let retry_strategy = ExponentialBackoff::from_millis(100)
            .map(jitter)
            .take(self.retry_attempts);

        Retry::spawn(retry_strategy, || self.upsert_once(sink, batch)).await
    }

    async fn upsert_once(&self, sink: &dyn VectorSink, batch: &[VectorRecord]) -> Result<(), AppError> {
        match tokio::time::timeout(self.timeout, sink.upsert(batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(sink = sink.name(), error = %err, "vector upsert failed");
                Err(AppError::Sink(format!("{}: {err}", sink.name())))
            }
            Err(_) => {
                warn!(sink = sink.name(), timeout = ?self.timeout, "vector upsert timed out");
                Err(AppError::Sink(format!(
                    "{}: upsert timed out after {:?}",
                    sink.name(),
                    self.timeout
                )))
            }
        }
    }

    pub async fn close(&self) {
        for sink in &self.sinks {
            match tokio::time::timeout(self.timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(sink = sink.name(), error = %err, "failed to close vector sink"),
                Err(_) => warn!(sink = sink.name(), timeout = ?self.timeout, "vector sink close timed out"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use common::{storage::store::StorageManager, utils::config::SinkConnection};

    use super::*;
    use crate::sinks::{MemorySink, SearchHit};

    struct FlakySink {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VectorSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn connect(&self) -> Result<(), AppError> {
            Ok(())
        }

        async fn upsert(&self, _batch: &[VectorRecord]) -> Result<(), AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AppError::Sink("transient".into()));
            }
            Ok(())
        }

        async fn search(&self, _: &[f32], _: usize) -> Result<Vec<SearchHit>, AppError> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<(), AppError> {
            Ok(())
        }
    }

    /// Never answers `connect` or `close`, like a database behind a black-holed port.
    struct HangingSink;

    #[async_trait]
    impl VectorSink for HangingSink {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn connect(&self) -> Result<(), AppError> {
            futures::future::pending::<()>().await;
            Ok(())
        }

        async fn upsert(&self, _batch: &[VectorRecord]) -> Result<(), AppError> {
            Ok(())
        }

        async fn search(&self, _: &[f32], _: usize) -> Result<Vec<SearchHit>, AppError> {
            Ok(Vec::new())
        }

        async fn close(&self) -> Result<(), AppError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn sample(rows: usize) -> (Vec<TextChunk>, VectorBatch) {
        let chunks = (0..rows)
            .map(|i| TextChunk::new("feed", i, i * 10, format!("chunk {i}"), None))
            .collect();
        let vectors = VectorBatch::from_rows((0..rows).map(|i| vec![i as f32, 1.0]).collect(), 2)
            .expect("vectors");
        (chunks, vectors)
    }

    #[tokio::test]
    async fn splits_into_batches_per_sink() {
        let memory = Arc::new(MemorySink::new("memory"));
        let loader =
            DatabaseLoader::with_sinks(vec![memory.clone()], 2, Duration::from_secs(5), 1);
        let (chunks, vectors) = sample(5);

        assert_eq!(loader.load(&chunks, &vectors).await.expect("load"), 5);
        assert_eq!(memory.batch_sizes().await, vec![2, 2, 1]);
        assert!(memory.get("feed:4").await.is_some());
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let flaky = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        });
        let loader = DatabaseLoader::with_sinks(vec![flaky.clone()], 10, Duration::from_secs(5), 3);
        let (chunks, vectors) = sample(1);

        loader.load(&chunks, &vectors).await.expect("load after retries");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let flaky = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(10),
            calls: AtomicUsize::new(0),
        });
        let loader = DatabaseLoader::with_sinks(vec![flaky.clone()], 10, Duration::from_secs(5), 1);
        let (chunks, vectors) = sample(1);

        assert!(matches!(
            loader.load(&chunks, &vectors).await,
            Err(AppError::Sink(_))
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn without_sinks_loading_fails() {
        let loader = DatabaseLoader::with_sinks(Vec::new(), 10, Duration::from_secs(1), 0);
        let (chunks, vectors) = sample(1);
        assert!(matches!(
            loader.load(&chunks, &vectors).await,
            Err(AppError::Sink(_))
        ));
    }

    #[tokio::test]
    async fn connect_drops_targets_without_connections() {
        let mut connections = HashMap::new();
        connections.insert("mem".to_string(), SinkConnection::Memory);
        let config = DatabaseConfig {
            batch_size: 8,
            timeout_secs: 5,
            retry_attempts: 1,
            targets: vec!["mem".into(), "missing".into()],
            connections,
        };
        let ctx = SinkContext {
            storage: StorageManager::memory(),
        };

        let loader = DatabaseLoader::connect(&config, &SinkRegistry::with_defaults(), &ctx).await;
        assert_eq!(loader.active_sinks(), vec!["mem"]);
    }

    #[tokio::test]
    async fn connect_drops_targets_that_never_answer() {
        let mut registry = SinkRegistry::empty();
        registry.register("memory", |_, _, _| Ok(Arc::new(HangingSink)));
        let mut connections = HashMap::new();
        connections.insert("stuck".to_string(), SinkConnection::Memory);
        let config = DatabaseConfig {
            batch_size: 8,
            timeout_secs: 1,
            retry_attempts: 0,
            targets: vec!["stuck".into()],
            connections,
        };
        let ctx = SinkContext {
            storage: StorageManager::memory(),
        };

        let loader = tokio::time::timeout(
            Duration::from_secs(10),
            DatabaseLoader::connect(&config, &registry, &ctx),
        )
        .await
        .expect("connect should give up on its own");
        assert!(loader.active_sinks().is_empty());
    }

    #[tokio::test]
    async fn close_gives_up_on_sinks_that_never_answer() {
        let loader = DatabaseLoader::with_sinks(
            vec![Arc::new(HangingSink)],
            8,
            Duration::from_millis(50),
            0,
        );

        tokio::time::timeout(Duration::from_secs(10), loader.close())
            .await
            .expect("close should give up on its own");
    }
}
