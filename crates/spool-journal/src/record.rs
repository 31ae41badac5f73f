//! Wire codec for journal operation records.
//!
//! Every record starts with a single opcode byte. Zero-payload opcodes are
//! one byte total; transaction opcodes carry a 32-bit transaction id; item
//! opcodes carry a length-prefixed block. All multi-byte integers are
//! little-endian.
//!
//! ```text
//! +----+--------------+-----------------+----------------+----------------+
//! | op | len (u32 LE) | add_time (u64)  | expiry (u64)   | data (len-16)  |
//! +----+--------------+-----------------+----------------+----------------+
//!   item block, opcode 2; total record length is 5 + len
//!
//! +----+--------------+
//! | op | xid (u32 LE) |
//! +----+--------------+
//!   transaction record, opcodes 4-6; 5 bytes
//!
//! +----+
//! | op |
//! +----+
//!   opcodes 1 and 3; 1 byte
//! ```
//!
//! Opcode 0 is the original item-block layout (`[len][expiry_seconds][data]`)
//! and is accepted on decode only; writers never emit it. Its `add_time` is
//! synthesized from the clock at decode time and a non-zero `expiry_seconds`
//! is scaled to milliseconds.
//!
//! The block length is validated against a caller-supplied cap BEFORE the
//! payload buffer is allocated, so a corrupt or hostile length prefix cannot
//! trigger an oversized allocation.

use std::io::{self, Read};

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::clock::Clock;
use crate::item::QueueItem;

/// Item block in the original layout. Decoded, never written.
pub const OP_ADD_LEGACY: u8 = 0;
/// The head item was consumed.
pub const OP_REMOVE: u8 = 1;
/// Item block in the current layout.
pub const OP_ADD: u8 = 2;
/// The head item was reserved by a transaction, not yet confirmed.
pub const OP_REMOVE_TENTATIVE: u8 = 3;
/// Checkpoint of the queue's next transaction-id counter.
pub const OP_SAVE_XID: u8 = 4;
/// A tentative remove was rolled back; the item returns to the head.
pub const OP_UNREMOVE: u8 = 5;
/// A tentative remove was confirmed; the item is gone.
pub const OP_CONFIRM_REMOVE: u8 = 6;

/// Bytes of item metadata (`add_time` + `expiry`) at the front of a block.
pub const ITEM_HEADER_LEN: usize = 16;

/// Bytes of item metadata (`expiry_seconds`) in a legacy block.
const LEGACY_ITEM_HEADER_LEN: usize = 4;

/// Default cap on a block payload (length prefix value), 16 MiB.
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 16 * 1024 * 1024;

/// Errors from encoding or decoding a single record.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// The opcode byte is not one of the known operations.
    #[error("unknown journal opcode: 0x{opcode:02x}")]
    UnknownOpcode {
        /// The unrecognized opcode byte.
        opcode: u8,
    },

    /// The input ended inside a record.
    #[error("unexpected end of journal inside a record")]
    UnexpectedEof,

    /// A block length prefix exceeds the configured cap.
    #[error("block of {len} bytes exceeds the {max}-byte limit")]
    BlockTooLarge {
        /// The length prefix read from the wire (or computed on encode).
        len: u64,
        /// The configured cap.
        max: u64,
    },

    /// A block length prefix is smaller than the item metadata it must
    /// contain.
    #[error("block of {len} bytes is shorter than the item header")]
    BlockTooShort {
        /// The length prefix read from the wire.
        len: u32,
    },

    /// The end-of-file marker is synthetic and has no wire form.
    #[error("end-of-file marker has no wire form")]
    Synthetic,

    /// I/O error reading the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One decoded journal operation.
///
/// `EndOfFile` is synthesized by the replayer when it reaches the end of a
/// sane file; it is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// An item was enqueued.
    Add(QueueItem),
    /// The head item was consumed.
    Remove,
    /// The head item was reserved by a transaction.
    RemoveTentative,
    /// Checkpoint of the next transaction-id counter.
    SaveXid(u32),
    /// Transaction rolled back; the item returns to the head.
    Unremove(u32),
    /// Transaction confirmed; the item is gone.
    ConfirmRemove(u32),
    /// Synthetic end-of-stream marker emitted by replay.
    EndOfFile,
}

impl Record {
    /// Wire opcode of this record, or `None` for the synthetic end-of-file
    /// marker.
    #[must_use]
    pub fn opcode(&self) -> Option<u8> {
        match self {
            Self::Add(_) => Some(OP_ADD),
            Self::Remove => Some(OP_REMOVE),
            Self::RemoveTentative => Some(OP_REMOVE_TENTATIVE),
            Self::SaveXid(_) => Some(OP_SAVE_XID),
            Self::Unremove(_) => Some(OP_UNREMOVE),
            Self::ConfirmRemove(_) => Some(OP_CONFIRM_REMOVE),
            Self::EndOfFile => None,
        }
    }

    /// On-disk size of this record in bytes, or `None` for the synthetic
    /// end-of-file marker.
    #[must_use]
    pub fn encoded_len(&self) -> Option<u64> {
        match self {
            Self::Add(item) => Some(5 + ITEM_HEADER_LEN as u64 + item.data.len() as u64),
            Self::Remove | Self::RemoveTentative => Some(1),
            Self::SaveXid(_) | Self::Unremove(_) | Self::ConfirmRemove(_) => Some(5),
            Self::EndOfFile => None,
        }
    }

    /// Append this record's wire bytes to `dst`, returning the number of
    /// bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Synthetic`] for [`Record::EndOfFile`] and
    /// [`RecordError::BlockTooLarge`] when an item payload cannot be
    /// described by a 32-bit length prefix.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<u64, RecordError> {
        match self {
            Self::Add(item) => {
                let block_len = ITEM_HEADER_LEN + item.data.len();
                let len = u32::try_from(block_len).map_err(|_| RecordError::BlockTooLarge {
                    len: block_len as u64,
                    max: u64::from(u32::MAX),
                })?;
                dst.reserve(5 + block_len);
                dst.put_u8(OP_ADD);
                dst.put_u32_le(len);
                dst.put_u64_le(item.add_time);
                dst.put_u64_le(item.expiry);
                dst.extend_from_slice(&item.data);
                Ok(5 + block_len as u64)
            }
            Self::Remove => {
                dst.put_u8(OP_REMOVE);
                Ok(1)
            }
            Self::RemoveTentative => {
                dst.put_u8(OP_REMOVE_TENTATIVE);
                Ok(1)
            }
            Self::SaveXid(xid) => {
                dst.put_u8(OP_SAVE_XID);
                dst.put_u32_le(*xid);
                Ok(5)
            }
            Self::Unremove(xid) => {
                dst.put_u8(OP_UNREMOVE);
                dst.put_u32_le(*xid);
                Ok(5)
            }
            Self::ConfirmRemove(xid) => {
                dst.put_u8(OP_CONFIRM_REMOVE);
                dst.put_u32_le(*xid);
                Ok(5)
            }
            Self::EndOfFile => Err(RecordError::Synthetic),
        }
    }
}

/// Read one record from `reader`.
///
/// Returns `Ok(None)` on clean end of input (no opcode byte available) and
/// `Ok(Some((record, bytes_consumed)))` otherwise. Input ending anywhere
/// after the opcode byte is [`RecordError::UnexpectedEof`].
///
/// `clock` is consulted only when an opcode-0 (legacy) block is decoded, to
/// synthesize the item's `add_time`.
///
/// # Errors
///
/// [`RecordError::UnknownOpcode`] for opcodes outside the known set,
/// [`RecordError::BlockTooLarge`] / [`RecordError::BlockTooShort`] for
/// implausible length prefixes (checked before the payload is allocated),
/// [`RecordError::UnexpectedEof`] for input ending mid-record, and
/// [`RecordError::Io`] for underlying read failures.
pub fn read_record<R: Read, C: Clock>(
    reader: &mut R,
    max_block_size: u32,
    clock: &C,
) -> Result<Option<(Record, u64)>, RecordError> {
    let mut opcode = [0u8; 1];
    match reader.read_exact(&mut opcode) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(RecordError::Io(err)),
    }

    match opcode[0] {
        OP_REMOVE => Ok(Some((Record::Remove, 1))),
        OP_REMOVE_TENTATIVE => Ok(Some((Record::RemoveTentative, 1))),
        OP_SAVE_XID => Ok(Some((Record::SaveXid(read_u32(reader)?), 5))),
        OP_UNREMOVE => Ok(Some((Record::Unremove(read_u32(reader)?), 5))),
        OP_CONFIRM_REMOVE => Ok(Some((Record::ConfirmRemove(read_u32(reader)?), 5))),
        OP_ADD => {
            let len = read_block_len(reader, max_block_size, ITEM_HEADER_LEN)?;
            let add_time = read_u64(reader)?;
            let expiry = read_u64(reader)?;
            let data = read_payload(reader, len as usize - ITEM_HEADER_LEN)?;
            let item = QueueItem {
                add_time,
                expiry,
                data: data.into(),
                xid: 0,
            };
            Ok(Some((Record::Add(item), 5 + u64::from(len))))
        }
        OP_ADD_LEGACY => {
            let len = read_block_len(reader, max_block_size, LEGACY_ITEM_HEADER_LEN)?;
            let expiry_seconds = read_u32(reader)?;
            let data = read_payload(reader, len as usize - LEGACY_ITEM_HEADER_LEN)?;
            let expiry = if expiry_seconds == 0 {
                0
            } else {
                u64::from(expiry_seconds) * 1000
            };
            let item = QueueItem {
                add_time: clock.now_ms(),
                expiry,
                data: data.into(),
                xid: 0,
            };
            Ok(Some((Record::Add(item), 5 + u64::from(len))))
        }
        opcode => Err(RecordError::UnknownOpcode { opcode }),
    }
}

/// Read and validate a block length prefix. The cap and minimum are checked
/// before any payload allocation.
fn read_block_len<R: Read>(
    reader: &mut R,
    max_block_size: u32,
    min_len: usize,
) -> Result<u32, RecordError> {
    let len = read_u32(reader)?;
    if len > max_block_size {
        return Err(RecordError::BlockTooLarge {
            len: u64::from(len),
            max: u64::from(max_block_size),
        });
    }
    if (len as usize) < min_len {
        return Err(RecordError::BlockTooShort { len });
    }
    Ok(len)
}

fn read_payload<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, RecordError> {
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).map_err(map_eof)?;
    Ok(data)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, RecordError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(map_eof)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, RecordError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(map_eof)?;
    Ok(u64::from_le_bytes(buf))
}

fn map_eof(err: io::Error) -> RecordError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        RecordError::UnexpectedEof
    } else {
        RecordError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::clock::ManualClock;

    fn decode(bytes: &[u8]) -> Result<Option<(Record, u64)>, RecordError> {
        let clock = ManualClock::new(0);
        read_record(&mut Cursor::new(bytes), DEFAULT_MAX_BLOCK_SIZE, &clock)
    }

    #[test]
    fn test_add_wire_format() {
        let record = Record::Add(QueueItem::new(1000, 0, &b"hi"[..]));
        assert_eq!(record.opcode(), Some(OP_ADD));
        let mut buf = BytesMut::new();
        let written = record.encode(&mut buf).expect("encode failed");

        let mut expected = vec![OP_ADD, 0x12, 0, 0, 0];
        expected.extend_from_slice(&1000u64.to_le_bytes());
        expected.extend_from_slice(&0u64.to_le_bytes());
        expected.extend_from_slice(b"hi");
        assert_eq!(&buf[..], &expected[..]);
        assert_eq!(written, 23);
    }

    #[test]
    fn test_fixed_record_wire_formats() {
        let cases = [
            (Record::Remove, vec![OP_REMOVE]),
            (Record::RemoveTentative, vec![OP_REMOVE_TENTATIVE]),
            (Record::SaveXid(17), vec![OP_SAVE_XID, 17, 0, 0, 0]),
            (Record::Unremove(3), vec![OP_UNREMOVE, 3, 0, 0, 0]),
            (
                Record::ConfirmRemove(0x0102_0304),
                vec![OP_CONFIRM_REMOVE, 4, 3, 2, 1],
            ),
        ];
        for (record, expected) in cases {
            let mut buf = BytesMut::new();
            let written = record.encode(&mut buf).expect("encode failed");
            assert_eq!(&buf[..], &expected[..], "wire mismatch for {record:?}");
            assert_eq!(written, expected.len() as u64);
            assert_eq!(record.encoded_len(), Some(written));
            assert_eq!(record.opcode(), Some(expected[0]));
        }
    }

    #[test]
    fn test_end_of_file_is_not_encodable() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            Record::EndOfFile.encode(&mut buf),
            Err(RecordError::Synthetic)
        ));
        assert!(buf.is_empty());
        assert_eq!(Record::EndOfFile.encoded_len(), None);
        assert_eq!(Record::EndOfFile.opcode(), None);
    }

    #[test]
    fn test_decode_round_trip() {
        let records = [
            Record::Add(QueueItem::new(7, 99, &b"abc"[..])),
            Record::Remove,
            Record::RemoveTentative,
            Record::SaveXid(42),
            Record::Unremove(42),
            Record::ConfirmRemove(42),
        ];
        for record in records {
            let mut buf = BytesMut::new();
            let written = record.encode(&mut buf).expect("encode failed");
            let (decoded, consumed) = decode(&buf).expect("decode failed").expect("no record");
            assert_eq!(decoded, record);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn test_empty_input_is_clean_eof() {
        assert!(decode(&[]).expect("decode failed").is_none());
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        assert!(matches!(
            decode(&[0x63]),
            Err(RecordError::UnknownOpcode { opcode: 0x63 })
        ));
    }

    #[test]
    fn test_truncated_length_prefix() {
        assert!(matches!(
            decode(&[OP_ADD, 0x12, 0]),
            Err(RecordError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_truncated_block_body() {
        let item = QueueItem::new(1, 0, &b"payload"[..]);
        let mut buf = BytesMut::new();
        Record::Add(item).encode(&mut buf).expect("encode failed");
        assert!(matches!(
            decode(&buf[..buf.len() - 1]),
            Err(RecordError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_truncated_xid() {
        assert!(matches!(
            decode(&[OP_SAVE_XID, 1, 2]),
            Err(RecordError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_oversized_block_is_rejected_before_allocation() {
        let mut bytes = vec![OP_ADD];
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let clock = ManualClock::new(0);
        // A tiny cap proves the length check fires without reading further.
        let result = read_record(&mut Cursor::new(&bytes), 1024, &clock);
        assert!(matches!(
            result,
            Err(RecordError::BlockTooLarge { len, max })
                if len == u64::from(u32::MAX) && max == 1024
        ));
    }

    #[test]
    fn test_undersized_block_is_rejected() {
        let mut bytes = vec![OP_ADD];
        bytes.extend_from_slice(&15u32.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(RecordError::BlockTooShort { len: 15 })
        ));
    }

    #[test]
    fn test_legacy_block_synthesizes_add_time() {
        let mut bytes = vec![OP_ADD_LEGACY];
        bytes.extend_from_slice(&7u32.to_le_bytes()); // 4 header + 3 data
        bytes.extend_from_slice(&9u32.to_le_bytes()); // expiry, seconds
        bytes.extend_from_slice(b"old");

        let clock = ManualClock::new(555_000);
        let (record, consumed) =
            read_record(&mut Cursor::new(&bytes), DEFAULT_MAX_BLOCK_SIZE, &clock)
                .expect("decode failed")
                .expect("no record");
        assert_eq!(consumed, 12);
        let Record::Add(item) = record else {
            panic!("expected an add record, got {record:?}");
        };
        assert_eq!(item.add_time, 555_000);
        assert_eq!(item.expiry, 9_000);
        assert_eq!(&item.data[..], b"old");
    }

    #[test]
    fn test_legacy_zero_expiry_stays_zero() {
        let mut bytes = vec![OP_ADD_LEGACY];
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let (record, _) = decode(&bytes).expect("decode failed").expect("no record");
        let Record::Add(item) = record else {
            panic!("expected an add record, got {record:?}");
        };
        assert_eq!(item.expiry, 0);
        assert!(item.data.is_empty());
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn arb_item() -> impl Strategy<Value = QueueItem> {
            (any::<u64>(), any::<u64>(), proptest::collection::vec(any::<u8>(), 0..512))
                .prop_map(|(add_time, expiry, data)| QueueItem::new(add_time, expiry, data))
        }

        fn arb_record() -> impl Strategy<Value = Record> {
            prop_oneof![
                arb_item().prop_map(Record::Add),
                Just(Record::Remove),
                Just(Record::RemoveTentative),
                any::<u32>().prop_map(Record::SaveXid),
                any::<u32>().prop_map(Record::Unremove),
                any::<u32>().prop_map(Record::ConfirmRemove),
            ]
        }

        proptest! {
            #[test]
            fn record_round_trips(record in arb_record()) {
                let mut buf = BytesMut::new();
                let written = record.encode(&mut buf).expect("encode failed");
                prop_assert_eq!(written, buf.len() as u64);

                let clock = ManualClock::new(0);
                let (decoded, consumed) =
                    read_record(&mut Cursor::new(&buf[..]), DEFAULT_MAX_BLOCK_SIZE, &clock)
                        .expect("decode failed")
                        .expect("no record");
                prop_assert_eq!(decoded, record);
                prop_assert_eq!(consumed, written);
            }

            #[test]
            fn sequences_round_trip(records in proptest::collection::vec(arb_record(), 0..24)) {
                let mut buf = BytesMut::new();
                for record in &records {
                    record.encode(&mut buf).expect("encode failed");
                }

                let clock = ManualClock::new(0);
                let mut cursor = Cursor::new(&buf[..]);
                let mut decoded = Vec::new();
                while let Some((record, _)) =
                    read_record(&mut cursor, DEFAULT_MAX_BLOCK_SIZE, &clock)
                        .expect("decode failed")
                {
                    decoded.push(record);
                }
                prop_assert_eq!(decoded, records);
            }

            #[test]
            fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let clock = ManualClock::new(0);
                let mut cursor = Cursor::new(&bytes[..]);
                while let Ok(Some(_)) =
                    read_record(&mut cursor, DEFAULT_MAX_BLOCK_SIZE, &clock)
                {}
            }
        }
    }
}
