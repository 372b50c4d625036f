//! Per-message payload compression.
//!
//! Two pluggable codecs over byte buffers, selected per message: LZO (fast,
//! modest ratio) and LZMA (slow, strong ratio, pays off on low-bandwidth
//! links). The sender picks the codec from its host configuration; the
//! receiver honors whatever the frame header declares.
//!
//! Raw LZO output does not record the uncompressed size, which the
//! decompressor needs up front, so LZO payloads carry a u64 big-endian
//! length prefix. The LZMA container already self-describes.

use crate::error::CompressionError;
use serde::{Deserialize, Serialize};

/// Compression applied to a message payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lzo,
    Lzma,
}

impl Compression {
    /// Wire encoding of the codec for the frame header.
    pub fn kind_byte(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lzo => 1,
            Compression::Lzma => 2,
        }
    }

    /// Inverse of [`kind_byte`](Self::kind_byte).
    pub fn from_kind_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Compression::None),
            1 => Some(Compression::Lzo),
            2 => Some(Compression::Lzma),
            _ => None,
        }
    }

    /// Parse the textual name used in hosts files and configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Compression::None),
            "lzo" => Some(Compression::Lzo),
            "lzma" => Some(Compression::Lzma),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lzo => "lzo",
            Compression::Lzma => "lzma",
        }
    }

    /// Compress a payload buffer.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lzo => {
                // Empty payloads (bare markers) stay as just the length
                // prefix; the codec itself only ever sees real data.
                if data.is_empty() {
                    return Ok(0u64.to_be_bytes().to_vec());
                }
                let mut lzo = minilzo_rs::LZO::init()
                    .map_err(|e| CompressionError::Lzo(format!("{e:?}")))?;
                let packed = lzo
                    .compress(data)
                    .map_err(|e| CompressionError::Lzo(format!("{e:?}")))?;
                let mut out = Vec::with_capacity(8 + packed.len());
                out.extend_from_slice(&(data.len() as u64).to_be_bytes());
                out.extend_from_slice(&packed);
                Ok(out)
            }
            Compression::Lzma => {
                let mut out = Vec::new();
                lzma_rs::lzma_compress(&mut &data[..], &mut out)
                    .map_err(|e| CompressionError::Lzma(format!("{e:?}")))?;
                Ok(out)
            }
        }
    }

    /// Decompress a payload buffer, refusing results above `cap` bytes.
    pub fn decompress(self, data: &[u8], cap: u64) -> Result<Vec<u8>, CompressionError> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lzo => {
                if data.len() < 8 {
                    return Err(CompressionError::Truncated);
                }
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&data[..8]);
                let len = u64::from_be_bytes(len_bytes);
                if len > cap {
                    return Err(CompressionError::TooLarge { size: len, cap });
                }
                if len == 0 {
                    return Ok(Vec::new());
                }
                let mut lzo = minilzo_rs::LZO::init()
                    .map_err(|e| CompressionError::Lzo(format!("{e:?}")))?;
                lzo.decompress_safe(&data[8..], len as usize)
                    .map_err(|e| CompressionError::Lzo(format!("{e:?}")))
            }
            Compression::Lzma => {
                let mut out = Vec::new();
                lzma_rs::lzma_decompress(&mut &data[..], &mut out)
                    .map_err(|e| CompressionError::Lzma(format!("{e:?}")))?;
                if out.len() as u64 > cap {
                    return Err(CompressionError::TooLarge {
                        size: out.len() as u64,
                        cap,
                    });
                }
                Ok(out)
            }
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
