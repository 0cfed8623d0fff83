use std::collections::BTreeMap;

use async_trait::async_trait;
use common::error::AppError;
use tokio::sync::RwLock;

use super::{rank, SearchHit, VectorRecord, VectorSink};

/// In-process cosine index. Keeps the size of every upsert call for inspection.
pub struct MemorySink {
    name: String,
    records: RwLock<BTreeMap<String, VectorRecord>>,
    batches: RwLock<Vec<usize>>,
}

impl MemorySink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            records: RwLock::new(BTreeMap::new()),
            batches: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<VectorRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Sizes of the upsert batches received so far, in call order.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batches.read().await.clone()
    }
}

#[async_trait]
impl VectorSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn upsert(&self, batch: &[VectorRecord]) -> Result<(), AppError> {
        let mut records = self.records.write().await;
        for record in batch {
            records.insert(record.id.clone(), record.clone());
        }
        self.batches.write().await.push(batch.len());
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, AppError> {
        let records = self.records.read().await;
        Ok(rank(records.values(), vector, limit))
    }

    async fn close(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn record(id: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.into(),
            vector,
            metadata: Value::Null,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let sink = MemorySink::new("memory");
        sink.upsert(&[record("h:0", vec![1.0, 0.0]), record("h:1", vec![0.0, 1.0])])
            .await
            .expect("first upsert");
        sink.upsert(&[record("h:0", vec![0.5, 0.5])])
            .await
            .expect("second upsert");

        assert_eq!(sink.len().await, 2);
        assert_eq!(sink.batch_sizes().await, vec![2, 1]);
        assert_eq!(
            sink.get("h:0").await.expect("record").vector,
            vec![0.5, 0.5]
        );

        let hits = sink.search(&[0.0, 1.0], 5).await.expect("search");
        assert_eq!(hits[0].id, "h:1");
    }
}
