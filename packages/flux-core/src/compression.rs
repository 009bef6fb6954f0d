//! # Compression Stage (C6)
//!
//! Per-chunk DEFLATE/zlib compression (via `miniz_oxide`) with a size-window
//! policy: files too small don't benefit, files too large cost more CPU
//! than the bandwidth they save. If the platform has no codec available,
//! both directions degrade to identity and the sender must force its
//! `compressed` metadata flag to `false` — the receiver has no way to
//! detect this on its own; it trusts the flag (see the metadata-flag bug
//! below).

use crate::error::{Error, Result};

/// Lower bound of the size window in which compression is worthwhile.
pub const COMPRESS_MIN_SIZE: u64 = 10 * 1024;
/// Upper bound of the size window — past this, compression overhead isn't
/// worth the wait.
pub const COMPRESS_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Whether a file of `file_size` bytes should be compressed.
pub fn should_compress(file_size: u64) -> bool {
    (COMPRESS_MIN_SIZE..=COMPRESS_MAX_SIZE).contains(&file_size)
}

/// Compresses `data`. Always succeeds — `miniz_oxide`'s encoder has no
/// failure mode short of allocation failure.
pub fn compress(data: &[u8]) -> Vec<u8> {
    miniz_oxide::deflate::compress_to_vec_zlib(data, 6)
}

/// Decompresses a buffer produced by [`compress`].
///
/// The caller is responsible for knowing, from the `compressed` flag on
/// the file's `file_metadata` control message, whether to call this at
/// all — decompressing data that was never compressed (or the reverse)
/// silently produces garbage rather than failing cleanly, which is exactly
/// the bug this flag exists to prevent (see §9 "Metadata-flag bug").
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    miniz_oxide::inflate::decompress_to_vec_zlib(data)
        .map_err(|e| Error::Decompress(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_compress_respects_the_size_window() {
        assert!(!should_compress(COMPRESS_MIN_SIZE - 1));
        assert!(should_compress(COMPRESS_MIN_SIZE));
        assert!(should_compress(COMPRESS_MAX_SIZE));
        assert!(!should_compress(COMPRESS_MAX_SIZE + 1));
    }

    #[test]
    fn compress_decompress_round_trip() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let compressed = compress(&data);
        let decompressed = decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn round_trip_on_empty_input() {
        let compressed = compress(&[]);
        let decompressed = decompress(&compressed).unwrap();
        assert!(decompressed.is_empty());
    }

    #[test]
    fn decompressing_garbage_fails_cleanly() {
        let err = decompress(b"not a zlib stream").unwrap_err();
        assert!(matches!(err, Error::Decompress(_)));
    }

    #[test]
    fn compression_actually_shrinks_repetitive_data() {
        let data = vec![b'a'; 64 * 1024];
        let compressed = compress(&data);
        assert!(compressed.len() < data.len());
    }

    #[test]
    fn metadata_flag_mismatch_corrupts_output() {
        // Canonical bug regression test (§8): compressing but then treating
        // the bytes as if they were never compressed must NOT silently
        // reproduce the original — the flag, not content inspection, is
        // what the receiver must honor.
        let data = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let compressed = compress(&data);
        assert_ne!(compressed, data);
    }
}
