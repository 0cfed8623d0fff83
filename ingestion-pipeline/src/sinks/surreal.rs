use async_trait::async_trait;
use common::{error::AppError, storage::db::SurrealDbClient, utils::config::SinkConnection};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::info;

use super::{SearchHit, VectorRecord, VectorSink};

#[derive(Debug, Serialize, Deserialize)]
struct StoredVector {
    source_id: String,
    vector: Vec<f32>,
    metadata_json: String,
}

#[derive(Debug, Deserialize)]
struct ScoredRow {
    source_id: String,
    metadata_json: String,
    score: f32,
}

/// Vectors stored as records of one SurrealDB table, keyed by the vector id.
pub struct SurrealSink {
    name: String,
    address: String,
    credentials: Option<(String, String)>,
    namespace: String,
    database: String,
    table: String,
    client: OnceCell<SurrealDbClient>,
}

fn valid_table_name(table: &str) -> bool {
    !table.is_empty()
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl SurrealSink {
    pub fn from_connection(name: &str, connection: &SinkConnection) -> Result<Self, AppError> {
        let SinkConnection::SurrealDb {
            address,
            username,
            password,
            namespace,
            database,
            table,
        } = connection
        else {
            return Err(AppError::Validation(format!(
                "target '{name}' is not a surrealdb connection"
            )));
        };

        if !valid_table_name(table) {
            return Err(AppError::Validation(format!(
                "invalid surrealdb table name '{table}' for target '{name}'"
            )));
        }

        let credentials = match (username, password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            (None, None) => None,
            _ => {
                return Err(AppError::Validation(format!(
                    "target '{name}' needs both username and password, or neither"
                )))
            }
        };

        Ok(Self {
            name: name.to_owned(),
            address: address.clone(),
            credentials,
            namespace: namespace.clone(),
            database: database.clone(),
            table: table.clone(),
            client: OnceCell::new(),
        })
    }

    async fn client(&self) -> Result<&SurrealDbClient, AppError> {
        self.client
            .get_or_try_init(|| async move {
                let credentials = self
                    .credentials
                    .as_ref()
                    .map(|(user, pass)| (user.as_str(), pass.as_str()));
                let client = SurrealDbClient::new(
                    &self.address,
                    credentials,
                    &self.namespace,
                    &self.database,
                )
                .await
                .map_err(|err| {
                    AppError::Sink(format!(
                        "cannot connect sink '{}' to {}: {err}",
                        self.name, self.address
                    ))
                })?;
                info!(sink = %self.name, address = %self.address, table = %self.table, "connected to SurrealDB");
                Ok::<_, AppError>(client)
            })
            .await
    }
}

#[async_trait]
impl VectorSink for SurrealSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), AppError> {
        self.client().await.map(|_| ())
    }

    async fn upsert(&self, batch: &[VectorRecord]) -> Result<(), AppError> {
        let db = self.client().await?;
        for record in batch {
            let stored = StoredVector {
                source_id: record.id.clone(),
                vector: record.vector.clone(),
                metadata_json: serde_json::to_string(&record.metadata)?,
            };
            db.client
                .query("UPSERT type::thing($table, $id) CONTENT $content RETURN NONE")
                .bind(("table", self.table.clone()))
                .bind(("id", record.id.clone()))
                .bind(("content", stored))
                .await?
                .check()?;
        }
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, AppError> {
        let db = self.client().await?;
        let sql = format!(
            "SELECT source_id, metadata_json, vector::similarity::cosine(vector, $query) AS score \
             FROM {} ORDER BY score DESC LIMIT $limit",
            self.table
        );
        let mut response = db
            .client
            .query(sql)
            .bind(("query", vector.to_vec()))
            .bind(("limit", limit))
            .await?;
        let rows: Vec<ScoredRow> = response.take(0)?;

        rows.into_iter()
            .map(|row| {
                Ok(SearchHit {
                    id: row.source_id,
                    score: row.score,
                    metadata: serde_json::from_str(&row.metadata_json)?,
                })
            })
            .collect()
    }

    async fn close(&self) -> Result<(), AppError> {
        Ok(())
    }
}
