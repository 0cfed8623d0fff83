use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::AppError;

const MAGIC: &[u8; 4] = b"ELV1";
const HEADER_LEN: usize = 12;
const ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

/// Row-major `f32` matrix, one row per chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorBatch {
    dimension: usize,
    values: Vec<f32>,
}

impl VectorBatch {
    pub fn from_rows(rows: Vec<Vec<f32>>, dimension: usize) -> Result<Self, AppError> {
        if dimension == 0 {
            return Err(AppError::Validation(
                "vector dimension must be greater than zero".into(),
            ));
        }
        let mut values = Vec::with_capacity(rows.len().saturating_mul(dimension));
        for (index, row) in rows.into_iter().enumerate() {
            if row.len() != dimension {
                return Err(AppError::Model(format!(
                    "embedding {index} has {} dimensions, expected {dimension}",
                    row.len()
                )));
            }
            if row.iter().any(|value| !value.is_finite()) {
                return Err(AppError::Model(format!(
                    "embedding {index} contains non-finite values"
                )));
            }
            values.extend(row);
        }
        Ok(Self { dimension, values })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn rows(&self) -> usize {
        self.values.len().checked_div(self.dimension).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        self.values.chunks_exact(self.dimension).nth(index)
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks_exact(self.dimension)
    }

    /// Encodes as `"ELV1" | rows: u32 | dim: u32 | rows * dim f32`, all little-endian.
    pub fn encode(&self) -> Result<Bytes, AppError> {
        let rows = u32::try_from(self.rows())
            .map_err(|_| AppError::Validation("too many vector rows to encode".into()))?;
        let dimension = u32::try_from(self.dimension)
            .map_err(|_| AppError::Validation("vector dimension too large to encode".into()))?;

        let mut buf = BytesMut::with_capacity(
            HEADER_LEN.saturating_add(self.values.len().saturating_mul(ELEMENT_BYTES)),
        );
        buf.put_slice(MAGIC);
        buf.put_u32_le(rows);
        buf.put_u32_le(dimension);
        for value in &self.values {
            buf.put_f32_le(*value);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut raw: &[u8]) -> Result<Self, AppError> {
        if raw.len() < HEADER_LEN || !raw.starts_with(MAGIC) {
            return Err(AppError::Validation("vector artifact header is invalid".into()));
        }
        raw.advance(MAGIC.len());
        let rows = raw.get_u32_le() as usize;
        let dimension = raw.get_u32_le() as usize;
        if dimension == 0 {
            return Err(AppError::Validation(
                "vector artifact declares zero dimension".into(),
            ));
        }

        let expected = rows
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(ELEMENT_BYTES))
            .ok_or_else(|| AppError::Validation("vector artifact size overflows".into()))?;
        if raw.remaining() != expected {
            return Err(AppError::Validation(format!(
                "vector artifact body is {} bytes, expected {expected}",
                raw.remaining()
            )));
        }

        let mut values = Vec::with_capacity(rows.saturating_mul(dimension));
        while raw.has_remaining() {
            values.push(raw.get_f32_le());
        }
        Ok(Self { dimension, values })
    }
}
