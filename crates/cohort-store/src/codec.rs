//! Compression facade for persisted records (feature-gated).
//!
//! Keep this tiny and synchronous. We only support `None`, `Zstd`, `Lz4`.
//! Checkpoints carry every response recorded so far, so large studies benefit
//! from `zstd`; the cache usually stays uncompressed.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Codec {
    None = 0,
    Zstd = 1,
    Lz4 = 2,
}

impl Codec {
    /// Parse a codec name as used in config files and CLI flags.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Codec::None),
            "zstd" => Ok(Codec::Zstd),
            "lz4" => Ok(Codec::Lz4),
            _ => Err(Error::CodecUnsupported("unknown codec name")),
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Zstd),
            2 => Ok(Codec::Lz4),
            _ => Err(Error::CodecUnsupported("unknown codec tag")),
        }
    }

    /// Whether this build can write records with the codec.
    pub fn is_available(self) -> bool {
        match self {
            Codec::None => true,
            Codec::Zstd => cfg!(feature = "zstd"),
            Codec::Lz4 => cfg!(feature = "lz4"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::None => "none",
            Codec::Zstd => "zstd",
            Codec::Lz4 => "lz4",
        }
    }
}

pub fn compress(codec: Codec, input: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(input.to_vec()),
        Codec::Zstd => zstd_backend::encode(input),
        Codec::Lz4 => lz4_backend::encode(input),
    }
}

pub fn decompress(codec: Codec, input: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(input.to_vec()),
        Codec::Zstd => zstd_backend::decode(input),
        Codec::Lz4 => lz4_backend::decode(input),
    }
}

#[cfg(feature = "zstd")]
mod zstd_backend {
    use crate::error::{Error, Result};

    const LEVEL: i32 = 3;

    pub fn encode(input: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(input, LEVEL).map_err(|e| Error::Codec(format!("zstd: {e}")))
    }

    pub fn decode(input: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(input).map_err(|e| Error::Codec(format!("zstd: {e}")))
    }
}

#[cfg(not(feature = "zstd"))]
mod zstd_backend {
    use crate::error::{Error, Result};

    pub fn encode(_: &[u8]) -> Result<Vec<u8>> {
        Err(Error::CodecUnsupported("zstd"))
    }

    pub fn decode(_: &[u8]) -> Result<Vec<u8>> {
        Err(Error::CodecUnsupported("zstd"))
    }
}

#[cfg(feature = "lz4")]
mod lz4_backend {
    use crate::error::{Error, Result};

    pub fn encode(input: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(input))
    }

    pub fn decode(input: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(input).map_err(|e| Error::Codec(format!("lz4: {e}")))
    }
}

#[cfg(not(feature = "lz4"))]
mod lz4_backend {
    use crate::error::{Error, Result};

    pub fn encode(_: &[u8]) -> Result<Vec<u8>> {
        Err(Error::CodecUnsupported("lz4"))
    }

    pub fn decode(_: &[u8]) -> Result<Vec<u8>> {
        Err(Error::CodecUnsupported("lz4"))
    }
}
