use common::{error::AppError, storage::types::TextChunk};
use text_splitter::{Characters, ChunkConfig, MarkdownSplitter, TextSplitter};

/// Character-capacity chunker. Identical input and configuration always yield the
/// same chunk sequence.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, AppError> {
        // Surface invalid bounds at construction instead of on the first file.
        Self::config(chunk_size, chunk_overlap)?;
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn config(
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<ChunkConfig<Characters>, AppError> {
        if chunk_size == 0 {
            return Err(AppError::Validation(
                "chunk size must be greater than zero".into(),
            ));
        }
        ChunkConfig::new(chunk_size)
            .with_overlap(chunk_overlap)
            .map_err(|e| AppError::Validation(format!("invalid chunk overlap: {e}")))
    }

    pub fn chunk(
        &self,
        file_hash: &str,
        text: &str,
        mime_type: &str,
        path: Option<&str>,
    ) -> Result<Vec<TextChunk>, AppError> {
        let config = Self::config(self.chunk_size, self.chunk_overlap)?;
        let pieces: Vec<(usize, &str)> = if is_markdown(mime_type) {
            MarkdownSplitter::new(config).chunk_indices(text).collect()
        } else {
            TextSplitter::new(config).chunk_indices(text).collect()
        };

        Ok(pieces
            .into_iter()
            .filter(|(_, piece)| !piece.trim().is_empty())
            .enumerate()
            .map(|(index, (offset, piece))| {
                TextChunk::new(
                    file_hash,
                    index,
                    offset,
                    piece.to_owned(),
                    path.map(str::to_owned),
                )
            })
            .collect())
    }
}

fn is_markdown(mime_type: &str) -> bool {
    matches!(mime_type, "text/markdown" | "text/x-markdown")
}
