//! Exhaustive nearest-neighbor structure over contiguous `f32` rows.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Number;
use crate::error::StoreError;
use crate::vector_ops::squared_l2_simd;

const MAGIC: &[u8; 4] = b"VKFL";
pub const FLAT_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;
const NUMBER_BYTES: usize = std::mem::size_of::<Number>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    SquaredL2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub distance: Number,
}

/// Row-major vectors of one fixed width. Rows are only ever appended; removal
/// means building a new index from the rows that survive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatL2Index {
    dimension: usize,
    data: Vec<Number>,
}

impl FlatL2Index {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn from_rows<'a>(dimension: usize, rows: impl IntoIterator<Item = &'a [Number]>) -> Self {
        let mut index = Self::new(dimension);
        for row in rows {
            index.add(row);
        }
        index
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one row. Width is checked by the owning index before this point.
    pub fn add(&mut self, vector: &[Number]) {
        debug_assert_eq!(vector.len(), self.dimension);
        self.data.extend_from_slice(vector);
    }

    pub fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows * self.dimension);
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Number]> + '_ {
        self.data.chunks_exact(self.dimension.max(1))
    }

    /// The `k` closest rows to `query`, nearest first. Equal distances keep
    /// insertion order.
    pub fn search(&self, query: &[Number], k: usize) -> Vec<Neighbor> {
        if k == 0 || self.is_empty() || query.len() != self.dimension {
            return Vec::new();
        }

        let mut neighbors: Vec<Neighbor> = self
            .data
            .par_chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, row)| Neighbor {
                position,
                distance: squared_l2_simd(query, row),
            })
            .collect();

        neighbors.par_sort_unstable_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        });
        neighbors.truncate(k);
        neighbors
    }

    /// Layout: magic, format version (u32), dimension (u32), row count (u64),
    /// then every value as little-endian f32.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * NUMBER_BYTES);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FLAT_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        bytes.extend(self.data.iter().flat_map(|&num| num.to_le_bytes()));
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(StoreError::Corrupt("index file has no valid header".to_string()));
        }

        let version = u32::from_le_bytes(le_array(&bytes[4..8]));
        if version != FLAT_FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported index format version {version}"
            )));
        }
        let dimension = u32::from_le_bytes(le_array(&bytes[8..12])) as usize;
        let rows = u64::from_le_bytes(le_array(&bytes[12..20])) as usize;

        if dimension == 0 {
            return Err(StoreError::Corrupt("index file records dimension 0".to_string()));
        }

        let expected = rows
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(NUMBER_BYTES))
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or_else(|| StoreError::Corrupt("index file header overflows".to_string()))?;
        if bytes.len() != expected {
            return Err(StoreError::Corrupt(format!(
                "index file is {} bytes, header implies {}",
                bytes.len(),
                expected
            )));
        }

        let data = bytes[HEADER_LEN..]
            .chunks_exact(NUMBER_BYTES)
            .map(|b| Number::from_le_bytes(le_array(b)))
            .collect();

        Ok(Self { dimension, data })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(rows: &[&[f32]]) -> FlatL2Index {
        FlatL2Index::from_rows(rows[0].len(), rows.iter().copied())
    }

    #[test]
    fn test_empty_index() {
        let index = FlatL2Index::new(4);
        assert!(index.is_empty());
        assert!(index.search(&[0.0; 4], 3).is_empty());
    }

    #[test]
    fn test_search_orders_by_distance() {
        let index = index_with(&[&[0.0, 0.0], &[3.0, 0.0], &[1.0, 0.0]]);
        let hits = index.search(&[0.0, 0.0], 3);

        let positions: Vec<usize> = hits.iter().map(|n| n.position).collect();
        assert_eq!(positions, vec![0, 2, 1]);
        assert_eq!(hits[1].distance, 1.0);
        assert_eq!(hits[2].distance, 9.0);
    }

    #[test]
    fn test_search_ties_keep_insertion_order() {
        let index = index_with(&[&[1.0, 0.0], &[0.0, 1.0], &[-1.0, 0.0], &[0.0, -1.0]]);
        let hits = index.search(&[0.0, 0.0], 4);
        let positions: Vec<usize> = hits.iter().map(|n| n.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_search_k_larger_than_len() {
        let index = index_with(&[&[1.0], &[2.0]]);
        assert_eq!(index.search(&[0.0], 10).len(), 2);
        assert!(index.search(&[0.0], 0).is_empty());
    }

    #[test]
    fn test_truncate_drops_trailing_rows() {
        let mut index = index_with(&[&[1.0, 1.0], &[2.0, 2.0], &[3.0, 3.0]]);
        index.truncate(1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.rows().next().unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn test_bytes_round_trip() {
        let index = index_with(&[&[0.5, -1.25, 3.0], &[7.0, 8.0, 9.5]]);
        let restored = FlatL2Index::from_bytes(&index.to_bytes()).unwrap();
        assert_eq!(restored, index);
    }

    #[test]
    fn test_from_bytes_rejects_truncated_file() {
        let index = index_with(&[&[0.5, 1.0], &[2.0, 3.0]]);
        let bytes = index.to_bytes();
        assert!(matches!(
            FlatL2Index::from_bytes(&bytes[..bytes.len() - 2]),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            FlatL2Index::from_bytes(b"nope"),
            Err(StoreError::Corrupt(_))
        ));
    }
}
