//! Chunk Framing (C5) — splitting a file into wire-framed chunks and
//! reassembling them from a (possibly out-of-order) stream on the receiver.

mod chunking;

pub use chunking::{
    chunk_stream, deserialize_chunk, serialize_chunk, Chunk, ChunkAccumulator, ChunkMetadata,
    DEFAULT_CHUNK_SIZE, FRAME_HEADER_LEN,
};
