pub mod file_record;
pub mod text_chunk;
pub mod vector_batch;

pub use file_record::{FileRecord, FileStatus};
pub use text_chunk::{ChunkMetadata, TextChunk};
pub use vector_batch::VectorBatch;
