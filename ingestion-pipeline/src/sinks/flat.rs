use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use common::{error::AppError, storage::store::StorageManager};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{rank, SearchHit, VectorRecord, VectorSink};

#[derive(Debug, Default, Serialize, Deserialize)]
struct FlatIndex {
    records: Vec<VectorRecord>,
}

struct FlatState {
    records: BTreeMap<String, VectorRecord>,
    loaded: bool,
}

/// Cosine index persisted as one JSON object in the cache storage.
///
/// The whole index is rewritten after every upsert, which keeps it consistent with the
/// manifest at the cost of write amplification on large corpora.
pub struct FlatSink {
    name: String,
    storage: StorageManager,
    location: String,
    state: Mutex<FlatState>,
}

impl FlatSink {
    pub fn new(name: &str, storage: StorageManager, location: String) -> Self {
        Self {
            name: name.to_owned(),
            storage,
            location,
            state: Mutex::new(FlatState {
                records: BTreeMap::new(),
                loaded: false,
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn ensure_loaded(&self, state: &mut FlatState) -> Result<(), AppError> {
        if state.loaded {
            return Ok(());
        }
        if let Some(raw) = self.storage.get_opt(&self.location).await? {
            let index: FlatIndex = serde_json::from_slice(&raw).map_err(|err| {
                AppError::Sink(format!("flat index {} is unreadable: {err}", self.location))
            })?;
            state.records = index
                .records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect();
            info!(
                sink = %self.name,
                records = state.records.len(),
                "loaded flat vector index"
            );
        }
        state.loaded = true;
        Ok(())
    }

    async fn flush(&self, state: &FlatState) -> Result<(), AppError> {
        let index = FlatIndex {
            records: state.records.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec(&index)?;
        self.storage
            .put(&self.location, Bytes::from(bytes))
            .await
            .map_err(|err| AppError::Sink(format!("failed to write flat index: {err}")))?;
        debug!(sink = %self.name, records = index.records.len(), "flushed flat index");
        Ok(())
    }
}

#[async_trait]
impl VectorSink for FlatSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await
    }

    async fn upsert(&self, batch: &[VectorRecord]) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        for record in batch {
            state.records.insert(record.id.clone(), record.clone());
        }
        self.flush(&state).await
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, AppError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(rank(state.records.values(), vector, limit))
    }

    async fn close(&self) -> Result<(), AppError> {
        let state = self.state.lock().await;
        if state.loaded {
            self.flush(&state).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            vector,
            metadata: json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn index_survives_reopening() {
        let storage = StorageManager::memory();
        let sink = FlatSink::new("flat", storage.clone(), "index/vectors.json".into());
        sink.connect().await.expect("connect");
        sink.upsert(&[record("h:0", vec![1.0, 0.0]), record("h:1", vec![0.0, 1.0])])
            .await
            .expect("upsert");
        sink.close().await.expect("close");

        let reopened = FlatSink::new("flat", storage, "index/vectors.json".into());
        reopened.connect().await.expect("connect");
        assert_eq!(reopened.len().await, 2);

        let hits = reopened.search(&[0.0, 1.0], 1).await.expect("search");
        assert_eq!(hits[0].id, "h:1");
        assert_eq!(hits[0].metadata["id"], "h:1");
    }

    #[tokio::test]
    async fn reupsert_does_not_duplicate() {
        let sink = FlatSink::new("flat", StorageManager::memory(), "v.json".into());
        sink.upsert(&[record("h:0", vec![1.0])]).await.expect("upsert");
        sink.upsert(&[record("h:0", vec![2.0])]).await.expect("upsert");
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn corrupt_index_is_a_sink_error() {
        let storage = StorageManager::memory();
        storage
            .put("v.json", Bytes::from_static(b"{not json"))
            .await
            .expect("put");
        let sink = FlatSink::new("flat", storage, "v.json".into());
        assert!(matches!(sink.connect().await, Err(AppError::Sink(_))));
    }
}
