#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod pipeline;
pub mod sinks;
pub mod utils;

pub use pipeline::{
    DefaultPipelineServices, FileOutcome, IngestionConfig, IngestionPipeline, IngestionTuning,
    PipelineServices, RunSummary,
};
pub use sinks::{DatabaseLoader, SinkContext, SinkRegistry, VectorSink};
