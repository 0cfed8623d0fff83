use chrono::Utc;
use common::{
    error::AppError,
    storage::types::{FileStatus, VectorBatch},
    utils::content_hash::hash_file,
};
use serde_json::{json, Map, Value};
use state_machines::core::GuardError;
use tracing::{debug, info, instrument, warn};

use super::{
    context::PipelineContext,
    state::{Chunked, Embedded, FileMachine, Loaded, Ready, Scanned},
};
use crate::utils::file_text_extraction::ExtractorRegistry;

pub const STAGE_SCAN: &str = "scan";
pub const STAGE_CHUNK: &str = "chunk";
pub const STAGE_EMBED: &str = "embed";
pub const STAGE_LOAD: &str = "load";

fn metadata(entries: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

#[instrument(level = "trace", skip_all, fields(file_hash = %ctx.file_hash))]
pub async fn scan(
    machine: FileMachine<(), Ready>,
    ctx: &mut PipelineContext<'_>,
) -> Result<FileMachine<(), Scanned>, AppError> {
    ctx.stage = STAGE_SCAN;

    if ctx.status.reached(FileStatus::Scanned) {
        if let Some(path) = ctx.verified_path() {
            ctx.state.record(&ctx.file_hash, ctx.status, Some(path), None).await?;
        }
    } else {
        let mut entries = vec![("scanned_at", json!(Utc::now().to_rfc3339()))];
        if let Some(mime_type) = &ctx.mime_type {
            entries.push(("mime_type", json!(mime_type)));
        }
        if let Some(path) = ctx.path.as_ref().filter(|_| ctx.source_verified) {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                entries.push(("size_bytes", json!(meta.len())));
            }
        }
        let path = ctx.verified_path();
        ctx.advance(FileStatus::Scanned, path, metadata(entries))
            .await?;
    }

    debug!(file_hash = %ctx.file_hash, status = %ctx.status, "file scanned");

    machine
        .scan()
        .map_err(|(_, guard)| map_guard_error(STAGE_SCAN, &guard))
}

#[instrument(level = "trace", skip_all, fields(file_hash = %ctx.file_hash))]
pub async fn chunk(
    machine: FileMachine<(), Scanned>,
    ctx: &mut PipelineContext<'_>,
) -> Result<FileMachine<(), Chunked>, AppError> {
    ctx.stage = STAGE_CHUNK;

    let cached = if ctx.completed.reached(FileStatus::Chunked) {
        ctx.archiver.load_chunks(&ctx.file_hash).await?
    } else {
        None
    };

    let chunks = match cached {
        Some(chunks) if !chunks.is_empty() => {
            debug!(file_hash = %ctx.file_hash, chunks = chunks.len(), "reusing cached chunks");
            chunks
        }
        _ => {
            if ctx.completed.reached(FileStatus::Chunked) {
                warn!(file_hash = %ctx.file_hash, "cached chunks missing or corrupt; regenerating");
            }
            let text = read_source(ctx).await?;
            let mime_type = ctx.mime_type.clone().unwrap_or_default();
            let path = ctx.path_label();
            let chunks = ctx
                .services
                .chunk(&ctx.file_hash, &text, &mime_type, path.as_deref())
                .await?;
            if chunks.is_empty() {
                return Err(AppError::Extraction(format!(
                    "no text chunks produced for {}",
                    path.as_deref().unwrap_or(&ctx.file_hash)
                )));
            }
            ctx.archiver.save_chunks(&ctx.file_hash, &chunks).await?;
            ctx.chunks_regenerated = true;
            chunks
        }
    };

    let chunk_count = chunks.len();
    ctx.chunks = Some(chunks);

    let entries = metadata([("chunk_count", json!(chunk_count))]);
    if !ctx.status.reached(FileStatus::Chunked) {
        ctx.advance(FileStatus::Chunked, None, entries).await?;
    } else if ctx.chunks_regenerated {
        ctx.state
            .record(&ctx.file_hash, ctx.status, None, Some(entries))
            .await?;
    }

    debug!(file_hash = %ctx.file_hash, chunk_count, "file chunked");

    machine
        .chunk()
        .map_err(|(_, guard)| map_guard_error(STAGE_CHUNK, &guard))
}

#[instrument(level = "trace", skip_all, fields(file_hash = %ctx.file_hash))]
pub async fn embed(
    machine: FileMachine<(), Chunked>,
    ctx: &mut PipelineContext<'_>,
) -> Result<FileMachine<(), Embedded>, AppError> {
    ctx.stage = STAGE_EMBED;

    let expected_rows = ctx.chunks()?.len();
    let dimension = ctx.services.dimension();

    let cached = if ctx.completed.reached(FileStatus::Embedded) && !ctx.chunks_regenerated {
        ctx.archiver.load_vectors(&ctx.file_hash).await?
    } else {
        None
    };

    let mut re_embedded = false;
    let vectors = match cached {
        Some(vectors) if vectors.rows() == expected_rows && vectors.dimension() == dimension => {
            debug!(file_hash = %ctx.file_hash, rows = vectors.rows(), "reusing cached vectors");
            vectors
        }
        _ => {
            if ctx.completed.reached(FileStatus::Embedded) && !ctx.chunks_regenerated {
                warn!(file_hash = %ctx.file_hash, "cached vectors missing or stale; re-embedding");
            }
            let texts: Vec<String> = ctx.chunks()?.iter().map(|c| c.text.clone()).collect();
            let rows = match ctx.services.embed(texts).await {
                Ok(rows) => rows,
                Err(err @ (AppError::Model(_) | AppError::OpenAI(_))) => {
                    return Err(escalate_if_offline(ctx, err).await);
                }
                Err(err) => return Err(err),
            };
            if rows.len() != expected_rows {
                return Err(AppError::Model(format!(
                    "embedder returned {} vectors for {expected_rows} chunks",
                    rows.len()
                )));
            }
            let vectors = VectorBatch::from_rows(rows, dimension)?;
            ctx.archiver.save_vectors(&ctx.file_hash, &vectors).await?;
            re_embedded = true;
            vectors
        }
    };

    let rows = vectors.rows();
    ctx.vectors = Some(vectors);

    let entries = metadata([
        ("vector_count", json!(rows)),
        ("dimension", json!(dimension)),
    ]);
    if !ctx.status.reached(FileStatus::Embedded) {
        ctx.advance(FileStatus::Embedded, None, entries).await?;
    } else if re_embedded {
        // Status stays put; only the vector metadata follows the new cache entry.
        ctx.state
            .record(&ctx.file_hash, ctx.status, None, Some(entries))
            .await?;
    }

    debug!(file_hash = %ctx.file_hash, rows, dimension, "file embedded");

    machine
        .embed()
        .map_err(|(_, guard)| map_guard_error(STAGE_EMBED, &guard))
}

#[instrument(level = "trace", skip_all, fields(file_hash = %ctx.file_hash))]
pub async fn load(
    machine: FileMachine<(), Embedded>,
    ctx: &mut PipelineContext<'_>,
) -> Result<FileMachine<(), Loaded>, AppError> {
    ctx.stage = STAGE_LOAD;

    let loaded = ctx.loader.load(ctx.chunks()?, ctx.vectors()?).await?;
    let sinks: Vec<String> = ctx
        .loader
        .active_sinks()
        .into_iter()
        .map(str::to_owned)
        .collect();

    ctx.advance(
        FileStatus::Loaded,
        None,
        metadata([
            ("loaded_vectors", json!(loaded)),
            ("sinks", json!(sinks)),
            ("loaded_at", json!(Utc::now().to_rfc3339())),
        ]),
    )
    .await?;

    info!(file_hash = %ctx.file_hash, loaded, "vectors loaded");

    machine
        .load()
        .map_err(|(_, guard)| map_guard_error(STAGE_LOAD, &guard))
}

/// A failed embedding call stays a per-file error only while the backend still
/// passes its health check; otherwise the run has to stop.
async fn escalate_if_offline(ctx: &PipelineContext<'_>, err: AppError) -> AppError {
    let Err(offline) = ctx.services.health_check().await else {
        return err;
    };
    warn!(file_hash = %ctx.file_hash, error = %err, "embedding backend went offline");
    match offline {
        AppError::ModelUnavailable(_) => offline,
        other => AppError::ModelUnavailable(other.to_string()),
    }
}

/// Extracts text from the source file, first confirming it still holds this content
/// when the path came from the manifest.
async fn read_source(ctx: &mut PipelineContext<'_>) -> Result<String, AppError> {
    let path = ctx.path.clone().ok_or_else(|| {
        AppError::Identity(format!("no source path recorded for {}", ctx.file_hash))
    })?;

    if !ctx.source_verified {
        let current = hash_file(&path).await?;
        if current != ctx.file_hash {
            return Err(AppError::Identity(format!(
                "{} no longer holds the content recorded as {}",
                path.display(),
                ctx.file_hash
            )));
        }
        ctx.source_verified = true;
    }

    let mime_type = ctx
        .mime_type
        .get_or_insert_with(|| ExtractorRegistry::detect_mime(&path))
        .clone();
    let text = ctx.services.extract(&path, &mime_type).await?;
    if text.trim().is_empty() {
        return Err(AppError::Extraction(format!(
            "no text extracted from {}",
            path.display()
        )));
    }
    Ok(text)
}

fn map_guard_error(event: &str, guard: &GuardError) -> AppError {
    AppError::InternalError(format!(
        "invalid file pipeline transition during {event}: {guard:?}"
    ))
}
