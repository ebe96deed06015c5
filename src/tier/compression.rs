//! Object codec for the secondary tier

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Compression algorithm applied to whole objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    #[default]
    Zstd,
}

/// Compress one object
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => {
            let mut encoder = zstd::Encoder::new(Vec::new(), 3)
                .map_err(|e| Error::Codec(format!("Failed to create zstd encoder: {}", e)))?;
            encoder
                .write_all(data)
                .map_err(|e| Error::Codec(format!("Failed to compress: {}", e)))?;
            encoder
                .finish()
                .map_err(|e| Error::Codec(format!("Failed to finish compression: {}", e)))
        }
    }
}

/// Decompress one object
pub fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Zstd => {
            zstd::decode_all(data).map_err(|e| Error::Codec(format!("Failed to decompress: {}", e)))
        }
    }
}

/// Decompress into a caller-provided page, which must be filled exactly
pub fn decompress_into(data: &[u8], algorithm: CompressionAlgorithm, page: &mut [u8]) -> Result<()> {
    let raw = decompress(data, algorithm)?;
    if raw.len() != page.len() {
        return Err(Error::Codec(format!(
            "decompressed {} bytes, expected {}",
            raw.len(),
            page.len()
        )));
    }
    page.copy_from_slice(&raw);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::index::PAGE_SIZE;

    #[test]
    fn test_compression_none() -> Result<()> {
        let data = b"Hello, World!";
        let compressed = compress(data, CompressionAlgorithm::None)?;
        assert_eq!(compressed, data);
        assert_eq!(decompress(&compressed, CompressionAlgorithm::None)?, data);
        Ok(())
    }

    #[test]
    fn test_zstd_page() -> Result<()> {
        let page = vec![0x5au8; PAGE_SIZE];
        let compressed = compress(&page, CompressionAlgorithm::Zstd)?;
        assert!(compressed.len() < PAGE_SIZE);

        let mut out = vec![0u8; PAGE_SIZE];
        decompress_into(&compressed, CompressionAlgorithm::Zstd, &mut out)?;
        assert_eq!(out, page);
        Ok(())
    }

    #[test]
    fn test_decompress_into_size_mismatch() -> Result<()> {
        let compressed = compress(b"short", CompressionAlgorithm::None)?;
        let mut out = vec![0u8; 16];
        let err = decompress_into(&compressed, CompressionAlgorithm::None, &mut out).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
        Ok(())
    }

    #[test]
    fn test_serde_names() -> Result<()> {
        let json = serde_json::to_string(&CompressionAlgorithm::Zstd)
            .map_err(|e| Error::Codec(e.to_string()))?;
        assert_eq!(json, "\"zstd\"");
        Ok(())
    }
}
