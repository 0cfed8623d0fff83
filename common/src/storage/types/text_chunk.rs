use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub file_hash: String,
    pub chunk_index: usize,
    /// Byte offset of the chunk within the extracted text.
    pub byte_offset: usize,
    pub char_len: usize,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl TextChunk {
    pub fn new(
        file_hash: &str,
        chunk_index: usize,
        byte_offset: usize,
        text: String,
        path: Option<String>,
    ) -> Self {
        let char_len = text.chars().count();
        Self {
            text,
            metadata: ChunkMetadata {
                file_hash: file_hash.to_owned(),
                chunk_index,
                byte_offset,
                char_len,
                path,
            },
        }
    }

    /// Stable sink id, identical across retries of the same file.
    pub fn vector_id(&self) -> String {
        format!("{}:{}", self.metadata.file_hash, self.metadata.chunk_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_id_combines_hash_and_index() {
        let chunk = TextChunk::new("deadbeef", 3, 12, "héllo".into(), None);
        assert_eq!(chunk.vector_id(), "deadbeef:3");
        assert_eq!(chunk.metadata.char_len, 5);
    }
}
