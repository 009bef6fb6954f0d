//! # Chunk Framing (C5)
//!
//! Splits a file into a lazy, finite, non-restartable stream of chunks and
//! reassembles them on the other side once every index has arrived.
//!
//! ## Wire form
//!
//! ```text
//! [ index: u32 LE ][ size: u32 LE ][ payload: size bytes ]
//! ```
//!
//! `size` carries the *pre-compression* logical length, even once a chunk
//! has been compressed by C6 — the receiver needs it to track progress
//! before it has decompressed anything.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Default chunk size, in bytes, per the external configuration (§6).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Length of the `[index][size]` header, in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Announces the chunks about to follow. Sent as the `file_metadata`
/// control message before the first chunk of a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub file_name: String,
    pub file_type: String,
    pub total_size: u64,
    pub chunk_size: usize,
    pub total_chunks: u32,
    pub compressed: bool,
}

impl ChunkMetadata {
    pub fn new(file_name: String, file_type: String, total_size: u64, chunk_size: usize) -> Self {
        let total_chunks = if total_size == 0 {
            0
        } else {
            ((total_size + chunk_size as u64 - 1) / chunk_size as u64) as u32
        };
        Self {
            file_name,
            file_type,
            total_size,
            chunk_size,
            total_chunks,
            compressed: false,
        }
    }
}

/// One framed slice of a file in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub size: u32,
    pub payload: Vec<u8>,
}

/// Splits `data` into a sequence of [`Chunk`]s of at most `chunk_size`
/// bytes each. The last chunk may be smaller. `chunk_size` must be
/// nonzero.
pub fn chunk_stream(data: &[u8], chunk_size: usize) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(Error::Malformed("chunk_size must be > 0".to_string()));
    }
    Ok(data
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, window)| Chunk {
            index: i as u32,
            size: window.len() as u32,
            payload: window.to_vec(),
        })
        .collect())
}

/// Serializes a chunk to its wire form: `[index u32 LE][size u32 LE][payload]`.
pub fn serialize_chunk(chunk: &Chunk) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + chunk.payload.len());
    out.extend_from_slice(&chunk.index.to_le_bytes());
    out.extend_from_slice(&chunk.size.to_le_bytes());
    out.extend_from_slice(&chunk.payload);
    out
}

/// Parses a chunk frame. Fails with [`Error::Malformed`] if the buffer is
/// shorter than the 8-byte header, or if the declared `size` overruns the
/// bytes actually present.
pub fn deserialize_chunk(bytes: &[u8]) -> Result<Chunk> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(Error::Malformed(format!(
            "frame is {} bytes, shorter than the {}-byte header",
            bytes.len(),
            FRAME_HEADER_LEN
        )));
    }
    let index = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let payload = &bytes[FRAME_HEADER_LEN..];
    if size as usize > payload.len() {
        return Err(Error::Malformed(format!(
            "declared size {} exceeds {} payload bytes present",
            size,
            payload.len()
        )));
    }
    Ok(Chunk {
        index,
        size,
        payload: payload[..size as usize].to_vec(),
    })
}

/// Receiver-side accumulator: collects chunks by index (arbitrary arrival
/// order) for one in-flight file and reassembles once complete.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    total_chunks: Option<u32>,
    chunks: BTreeMap<u32, Vec<u8>>,
    bytes_received: u64,
}

impl ChunkAccumulator {
    pub fn new(total_chunks: u32) -> Self {
        Self {
            total_chunks: Some(total_chunks),
            chunks: BTreeMap::new(),
            bytes_received: 0,
        }
    }

    /// Resets the accumulator for a new file, per `file_metadata`.
    pub fn reset(&mut self, total_chunks: u32) {
        self.total_chunks = Some(total_chunks);
        self.chunks.clear();
        self.bytes_received = 0;
    }

    /// Stores `chunk` by index. Returns `false` if this index was already
    /// stored (duplicate, benign under at-least-once retries).
    pub fn add_chunk(&mut self, chunk: Chunk) -> bool {
        if self.chunks.contains_key(&chunk.index) {
            return false;
        }
        self.bytes_received += chunk.payload.len() as u64;
        self.chunks.insert(chunk.index, chunk.payload);
        true
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn is_complete(&self) -> bool {
        match self.total_chunks {
            Some(total) => self.chunks.len() as u32 == total,
            None => false,
        }
    }

    /// Indices in `[0, total_chunks)` not yet received.
    pub fn missing_chunks(&self) -> Vec<u32> {
        let Some(total) = self.total_chunks else {
            return Vec::new();
        };
        (0..total).filter(|i| !self.chunks.contains_key(i)).collect()
    }

    /// Fraction of chunks received, in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        match self.total_chunks {
            Some(0) => 1.0,
            Some(total) => self.chunks.len() as f64 / total as f64,
            None => 0.0,
        }
    }

    /// Concatenates payloads in index order. Fails with [`Error::Incomplete`]
    /// if any index in `[0, total_chunks)` is still missing.
    pub fn merge(&self) -> Result<Vec<u8>> {
        let missing = self.missing_chunks();
        if !missing.is_empty() {
            return Err(Error::Incomplete(missing.len()));
        }
        let mut out = Vec::with_capacity(self.bytes_received as usize);
        for payload in self.chunks.values() {
            out.extend_from_slice(payload);
        }
        Ok(out)
    }

    /// Alias for [`Self::merge`] matching the "write the finished file"
    /// naming used at the call site.
    pub fn to_file(&self) -> Result<Vec<u8>> {
        self.merge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_deserialize_round_trip() {
        let chunk = Chunk {
            index: 7,
            size: 5,
            payload: b"hello".to_vec(),
        };
        let bytes = serialize_chunk(&chunk);
        let parsed = deserialize_chunk(&bytes).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn deserialize_rejects_short_frame() {
        let err = deserialize_chunk(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn deserialize_rejects_size_overrun() {
        let mut bytes = 0u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"short");
        let err = deserialize_chunk(&bytes).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn chunk_stream_splits_with_smaller_last_chunk() {
        let data = b"0123456789ABCDE"; // 15 bytes
        let chunks = chunk_stream(data, 4).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].payload, b"E");
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn chunk_stream_rejects_zero_size() {
        assert!(chunk_stream(b"data", 0).is_err());
    }

    #[test]
    fn split_merge_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let chunks = chunk_stream(data, 6).unwrap();
        let mut acc = ChunkAccumulator::new(chunks.len() as u32);
        for chunk in chunks {
            assert!(acc.add_chunk(chunk));
        }
        assert!(acc.is_complete());
        assert_eq!(acc.merge().unwrap(), data);
    }

    #[test]
    fn accumulator_allows_out_of_order_arrival() {
        let data = b"ABCDEFGHIJKLMNOP";
        let mut chunks = chunk_stream(data, 4).unwrap();
        chunks.reverse();
        let mut acc = ChunkAccumulator::new(chunks.len() as u32);
        for chunk in chunks {
            acc.add_chunk(chunk);
        }
        assert_eq!(acc.merge().unwrap(), data);
    }

    #[test]
    fn duplicate_chunk_is_rejected() {
        let mut acc = ChunkAccumulator::new(2);
        let chunk = Chunk { index: 0, size: 1, payload: vec![1] };
        assert!(acc.add_chunk(chunk.clone()));
        assert!(!acc.add_chunk(chunk));
    }

    #[test]
    fn merge_fails_when_chunks_missing() {
        let mut acc = ChunkAccumulator::new(3);
        acc.add_chunk(Chunk { index: 0, size: 1, payload: vec![1] });
        let err = acc.merge().unwrap_err();
        match err {
            Error::Incomplete(n) => assert_eq!(n, 2),
            _ => panic!("expected Incomplete"),
        }
    }

    #[test]
    fn missing_chunks_lists_unreceived_indices() {
        let mut acc = ChunkAccumulator::new(3);
        acc.add_chunk(Chunk { index: 1, size: 1, payload: vec![1] });
        assert_eq!(acc.missing_chunks(), vec![0, 2]);
    }

    #[test]
    fn progress_tracks_fraction_received() {
        let mut acc = ChunkAccumulator::new(4);
        assert_eq!(acc.progress(), 0.0);
        acc.add_chunk(Chunk { index: 0, size: 1, payload: vec![1] });
        assert_eq!(acc.progress(), 0.25);
    }

    #[test]
    fn reset_clears_state_for_next_file() {
        let mut acc = ChunkAccumulator::new(1);
        acc.add_chunk(Chunk { index: 0, size: 1, payload: vec![1] });
        assert!(acc.is_complete());
        acc.reset(2);
        assert!(!acc.is_complete());
        assert_eq!(acc.missing_chunks(), vec![0, 1]);
    }

    #[test]
    fn empty_file_is_immediately_complete() {
        let acc = ChunkAccumulator::new(0);
        assert!(acc.is_complete());
        assert_eq!(acc.merge().unwrap(), Vec::<u8>::new());
    }
}
