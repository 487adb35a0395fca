//! Framing for on-disk entries.
//!
//! Every entry is JSON wrapped in a length prefix and a CRC32 trailer:
//!
//! ```text
//! [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```
//!
//! Files start with a five byte header: [`MAGIC`] followed by the version.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

const CODEC_VERSION: u8 = 1;

/// Largest entry accepted on decode.
const MAX_ENTRY_SIZE: usize = 256 * 1024 * 1024;

/// Magic bytes identifying dualstore files.
pub const MAGIC: [u8; 4] = *b"DSTR";

/// Length of the file header.
pub const HEADER_LEN: u64 = 5;

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Encodes a value as one framed entry.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidData, "entry larger than 4 GiB"))?;

    let mut out = Vec::with_capacity(data.len() + 9);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());
    Ok(out)
}

/// Decodes one framed entry, verifying its checksum.
///
/// # Errors
/// - `UnexpectedEof` if the frame is cut short (a torn write)
/// - `InvalidData` on version, size, checksum, or JSON problems
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported codec version {} (expected {CODEC_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_ENTRY_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("entry size {len} exceeds maximum {MAX_ENTRY_SIZE}"),
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
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and checks the file header, returning the version byte.
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
    use crate::record::{EntityRecord, EntityType};
    use crate::storage::persistent::wal::{WalEntry, WalEntryKind};
    use chrono::Utc;
    use std::io::Cursor;

    #[test]
    fn test_wal_entry_roundtrip() {
        let entry = WalEntry {
            sequence: 7,
            timestamp: Utc::now(),
            kind: WalEntryKind::Create {
                entity_type: EntityType::Clients,
                record: EntityRecord::with_id("c1").field("name", "Acme"),
            },
        };
        let bytes = encode(&entry).unwrap();
        let decoded: WalEntry = decode(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(decoded.sequence, 7);
        assert!(matches!(decoded.kind, WalEntryKind::Create { .. }));
    }

    #[test]
    fn test_detects_bit_flip() {
        let mut bytes = encode(&"payload".to_string()).unwrap();
        bytes[7] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_frame_is_eof() {
        let bytes = encode(&"payload".to_string()).unwrap();
        let torn = bytes[..bytes.len() - 2].to_vec();
        let err = decode::<String>(&mut Cursor::new(torn)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_oversized_length() {
        let mut bytes = vec![CODEC_VERSION];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = decode::<String>(&mut Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header_roundtrip_and_bad_magic() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);
        assert_eq!(read_header(&mut Cursor::new(&buf)).unwrap(), CODEC_VERSION);

        buf[0] = b'X';
        assert!(read_header(&mut Cursor::new(&buf)).is_err());
    }
}
