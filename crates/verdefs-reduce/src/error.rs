//! Error types for the verdefs-reduce subsystem

/// All errors that can occur during data reduction operations
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ReduceError::CompressionFailed("buffer too small".into());
        assert_eq!(format!("{}", err), "Compression failed: buffer too small");
    }
}
