//! LZ4 and Zstd compression/decompression for block payloads

use serde::{Deserialize, Serialize};

use crate::error::ReduceError;

/// Compression algorithm selection, stored per inode and stamped into each
/// block reference so reads decode with the algorithm the write used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    /// No compression (passthrough)
    #[default]
    None,
    /// LZ4 block format with prepended size — hot path
    Lz4,
    /// Zstandard — higher ratio, slower
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

/// Compress data with the given algorithm. Returns compressed bytes.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| ReduceError::CompressionFailed(e.to_string()))
        }
    }
}

/// Decompress data using the algorithm that was used for compression.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| ReduceError::DecompressionFailed(e.to_string())),
        CompressionAlgorithm::Zstd { .. } => {
            zstd::decode_all(data).map_err(|e| ReduceError::DecompressionFailed(e.to_string()))
        }
    }
}

/// Check whether compressing data is worthwhile.
/// Returns false if data appears to be already compressed or random (high entropy).
pub fn is_compressible(data: &[u8]) -> bool {
    if data.len() < 64 {
        return true;
    }
    let sample = &data[..data.len().min(1024)];
    let compressed = lz4_flex::compress_prepend_size(sample);
    (compressed.len() as f64) < (sample.len() as f64 * 0.95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_lz4_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000)) {
            let c = compress(&data, CompressionAlgorithm::Lz4).unwrap();
            let d = decompress(&c, CompressionAlgorithm::Lz4).unwrap();
            prop_assert_eq!(d, data);
        }
        #[test]
        fn prop_zstd_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000)) {
            let c = compress(&data, CompressionAlgorithm::Zstd { level: 3 }).unwrap();
            let d = decompress(&c, CompressionAlgorithm::Zstd { level: 3 }).unwrap();
            prop_assert_eq!(d, data);
        }
        #[test]
        fn prop_none_roundtrip(data in prop::collection::vec(0u8..=255, 0..100_000)) {
            let c = compress(&data, CompressionAlgorithm::None).unwrap();
            let d = decompress(&c, CompressionAlgorithm::None).unwrap();
            prop_assert_eq!(d, data);
        }
    }

    #[test]
    fn empty_roundtrips() {
        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd { level: 3 },
        ] {
            let c = compress(&[], algo).unwrap();
            let d = decompress(&c, algo).unwrap();
            assert_eq!(d, b"");
        }
    }

    #[test]
    fn repetitive_data_is_compressible() {
        let data = vec![0x42u8; 4096];
        assert!(is_compressible(&data));
        let c = compress(&data, CompressionAlgorithm::Lz4).unwrap();
        assert!(c.len() < data.len());
    }
}
