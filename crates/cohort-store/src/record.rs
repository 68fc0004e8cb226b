//! Framed record format shared by checkpoints and persisted cache entries.
//!
//! Layout:
//! [ magic: u32 ][ version: u16 ][ codec: u8 ][ kind: u8 ]
//! [ uncompressed_len: u64 ][ compressed_len: u64 ]
//! [ payload bytes … ]
//! [ blake3(header || payload): 32 bytes ]
//!
//! A record that is truncated, has a bad header, or fails the checksum is
//! reported as `Error::Corrupt` and never decoded.

use crate::codec::{self, Codec};
use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x4348_5254; // "CHRT"
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 1 + 1 + 8 + 8;
pub const CHECKSUM_LEN: usize = 32;

/// Sanity limit against corrupted length fields.
const MAX_PAYLOAD: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Checkpoint = 1,
    CacheEntry = 2,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordKind::Checkpoint),
            2 => Some(RecordKind::CacheEntry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordHeader {
    codec: Codec,
    kind: RecordKind,
    uncompressed_len: u64,
    compressed_len: u64,
}

impl RecordHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&VERSION.to_le_bytes());
        out[6] = self.codec as u8;
        out[7] = self.kind as u8;
        out[8..16].copy_from_slice(&self.uncompressed_len.to_le_bytes());
        out[16..24].copy_from_slice(&self.compressed_len.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err("short header".into());
        }
        let mut u32buf = [0u8; 4];
        u32buf.copy_from_slice(&bytes[0..4]);
        let mut u16buf = [0u8; 2];
        u16buf.copy_from_slice(&bytes[4..6]);
        if u32::from_le_bytes(u32buf) != MAGIC || u16::from_le_bytes(u16buf) != VERSION {
            return Err("bad magic/version".into());
        }
        let codec = Codec::from_u8(bytes[6]).map_err(|e| e.to_string())?;
        let kind = RecordKind::from_u8(bytes[7]).ok_or("unknown record kind")?;
        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(&bytes[8..16]);
        let uncompressed_len = u64::from_le_bytes(u64buf);
        u64buf.copy_from_slice(&bytes[16..24]);
        let compressed_len = u64::from_le_bytes(u64buf);
        if uncompressed_len > MAX_PAYLOAD || compressed_len > MAX_PAYLOAD {
            return Err(format!(
                "payload length {compressed_len}/{uncompressed_len} exceeds limit"
            ));
        }
        Ok(Self {
            codec,
            kind,
            uncompressed_len,
            compressed_len,
        })
    }
}

/// Frame `payload` as a record of `kind`, compressing with `codec`.
pub fn encode(kind: RecordKind, codec: Codec, payload: &[u8]) -> Result<Vec<u8>> {
    let compressed = codec::compress(codec, payload)?;
    let header = RecordHeader {
        codec,
        kind,
        uncompressed_len: payload.len() as u64,
        compressed_len: compressed.len() as u64,
    }
    .to_bytes();

    let mut hasher = blake3::Hasher::new();
    hasher.update(&header);
    hasher.update(&compressed);
    let checksum: [u8; 32] = hasher.finalize().into();

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len() + CHECKSUM_LEN);
    out.extend_from_slice(&header);
    out.extend_from_slice(&compressed);
    out.extend_from_slice(&checksum);
    Ok(out)
}

/// Verify and unframe a record, returning its decompressed payload.
///
/// `path` is only used for error context.
pub fn decode(path: &str, expected: RecordKind, bytes: &[u8]) -> Result<Vec<u8>> {
    let corrupt = |reason: String| Error::Corrupt {
        path: path.to_string(),
        reason,
    };

    let header = RecordHeader::from_bytes(bytes).map_err(corrupt)?;
    if header.kind != expected {
        return Err(corrupt(format!(
            "expected {:?} record, found {:?}",
            expected, header.kind
        )));
    }

    let body_end = HEADER_LEN + header.compressed_len as usize;
    if bytes.len() != body_end + CHECKSUM_LEN {
        return Err(corrupt(format!(
            "length {} does not match header (expected {})",
            bytes.len(),
            body_end + CHECKSUM_LEN
        )));
    }

    let computed: [u8; 32] = blake3::hash(&bytes[..body_end]).into();
    if computed[..] != bytes[body_end..] {
        return Err(corrupt("checksum mismatch".into()));
    }

    let payload = codec::decompress(header.codec, &bytes[HEADER_LEN..body_end])?;
    if payload.len() as u64 != header.uncompressed_len {
        return Err(corrupt("decompressed length mismatch".into()));
    }
    Ok(payload)
}
