//! Frame codec for journal and snapshot files.
//!
//! Every record on disk is one frame:
//!
//! ```text
//! [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```
//!
//! Files start with `[MAGIC: 4 bytes][VERSION: 1 byte]`.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying namesake files.
pub const MAGIC: [u8; 4] = *b"NSKE";

/// Size of the file header in bytes.
pub const HEADER_LEN: u64 = 5;

/// Largest frame payload accepted on read.
const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Serializes `value` into one checksummed frame.
///
/// # Errors
///
/// Returns `InvalidData` if the value cannot be serialized or is too large.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len()).map_err(|_| {
        IoError::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes does not fit a u32 length", data.len()),
        )
    })?;

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());
    Ok(out)
}

/// Reads one frame and deserializes it, verifying the checksum.
///
/// # Errors
///
/// - `UnexpectedEof` if the frame is cut short (a torn write)
/// - `InvalidData` on version, size or checksum mismatch, or bad JSON
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version: {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);
    if stored != computed {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored:08x}, computed={computed:08x}"),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Writes the file header.
///
/// # Errors
///
/// Propagates I/O errors.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and validates the file header, returning its version.
///
/// # Errors
///
/// Returns `InvalidData` if the magic bytes do not match.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::storage::{CommitBatch, Mutation};

    #[test]
    fn test_frame_roundtrip() {
        let batch = CommitBatch {
            mutations: vec![Mutation::RegisterTable {
                table: "ctw_stats".to_string(),
            }],
        };
        let encoded = encode(&batch).unwrap();
        let decoded: CommitBatch = decode(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode(&"sheep_stats".to_string()).unwrap();
        encoded[7] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame_is_eof() {
        let encoded = encode(&"ww_stats".to_string()).unwrap();
        let cut = &encoded[..encoded.len() - 2];
        let err = decode::<String>(&mut Cursor::new(cut)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut bad = vec![CODEC_VERSION];
        bad.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = decode::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);
        assert_eq!(read_header(&mut Cursor::new(buf)).unwrap(), CODEC_VERSION);

        let err = read_header(&mut Cursor::new(b"ABCD\x01".to_vec())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
