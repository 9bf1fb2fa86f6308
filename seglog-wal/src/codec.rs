//! Entry codec.
//!
//! Entries are encoded with the protobuf wire format so segment files stay
//! readable by other implementations of the same log:
//!
//! ```text
//! field 1  sequence_number  varint            omitted when 0
//! field 2  payload          length-delimited  omitted when empty
//! field 3  checksum         varint (u32)      omitted when 0
//! field 4  is_checkpoint    varint (bool)     written only when set
//! ```
//!
//! Unknown fields are skipped, so newer writers may add fields.

use crate::entry::WalEntry;
use crate::error::{DecodeError, WalError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FIELD_SEQUENCE: u64 = 1;
const FIELD_PAYLOAD: u64 = 2;
const FIELD_CHECKSUM: u64 = 3;
const FIELD_CHECKPOINT: u64 = 4;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Encodes an entry. Never fails.
pub fn encode(entry: &WalEntry) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(entry));

    if entry.sequence_number != 0 {
        put_key(&mut buf, FIELD_SEQUENCE, WIRE_VARINT);
        put_varint(&mut buf, entry.sequence_number);
    }
    if !entry.payload.is_empty() {
        put_key(&mut buf, FIELD_PAYLOAD, WIRE_LEN);
        put_varint(&mut buf, entry.payload.len() as u64);
        buf.put_slice(&entry.payload);
    }
    if entry.checksum != 0 {
        put_key(&mut buf, FIELD_CHECKSUM, WIRE_VARINT);
        put_varint(&mut buf, u64::from(entry.checksum));
    }
    if let Some(flag) = entry.is_checkpoint {
        put_key(&mut buf, FIELD_CHECKPOINT, WIRE_VARINT);
        put_varint(&mut buf, u64::from(flag));
    }

    buf.freeze()
}

/// Decodes an entry without checking its checksum.
///
/// The payload is sliced out of `buf` without copying.
pub fn decode(mut buf: Bytes) -> Result<WalEntry, DecodeError> {
    let mut entry = WalEntry {
        sequence_number: 0,
        payload: Bytes::new(),
        checksum: 0,
        is_checkpoint: None,
    };

    while buf.has_remaining() {
        let key = get_varint(&mut buf, "field key")?;
        let field = key >> 3;
        let wire_type = (key & 0x7) as u8;

        match field {
            FIELD_SEQUENCE => {
                expect_wire_type(field, wire_type, WIRE_VARINT)?;
                entry.sequence_number = get_varint(&mut buf, "sequence_number")?;
            }
            FIELD_PAYLOAD => {
                expect_wire_type(field, wire_type, WIRE_LEN)?;
                let len = get_len(&mut buf, "payload")?;
                entry.payload = buf.split_to(len);
            }
            FIELD_CHECKSUM => {
                expect_wire_type(field, wire_type, WIRE_VARINT)?;
                // uint32 fields keep the low 32 bits of the varint.
                entry.checksum = get_varint(&mut buf, "checksum")? as u32;
            }
            FIELD_CHECKPOINT => {
                expect_wire_type(field, wire_type, WIRE_VARINT)?;
                entry.is_checkpoint = Some(get_varint(&mut buf, "is_checkpoint")? != 0);
            }
            _ => skip_field(&mut buf, field, wire_type)?,
        }
    }

    Ok(entry)
}

/// Decodes an entry read at `offset` and verifies its checksum.
pub fn decode_and_verify(buf: Bytes, offset: u64) -> Result<WalEntry, WalError> {
    let entry = decode(buf).map_err(|source| WalError::Malformed { offset, source })?;
    entry.verify()?;
    Ok(entry)
}

/// Returns the exact number of bytes [`encode`] produces for `entry`.
pub fn encoded_len(entry: &WalEntry) -> usize {
    let mut len = 0;
    if entry.sequence_number != 0 {
        len += 1 + varint_len(entry.sequence_number);
    }
    if !entry.payload.is_empty() {
        len += 1 + varint_len(entry.payload.len() as u64) + entry.payload.len();
    }
    if entry.checksum != 0 {
        len += 1 + varint_len(u64::from(entry.checksum));
    }
    if entry.is_checkpoint.is_some() {
        len += 2;
    }
    len
}

fn put_key(buf: &mut BytesMut, field: u64, wire_type: u8) {
    put_varint(buf, (field << 3) | u64::from(wire_type));
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

fn get_varint<B: Buf>(buf: &mut B, what: &'static str) -> Result<u64, DecodeError> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(DecodeError::Truncated(what));
        }
        let byte = buf.get_u8();
        // The tenth byte may only carry the top bit of a u64.
        if shift == 63 && byte > 1 {
            return Err(DecodeError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::VarintOverflow)
}

fn get_len<B: Buf>(buf: &mut B, what: &'static str) -> Result<usize, DecodeError> {
    let len = get_varint(buf, what)?;
    match usize::try_from(len) {
        Ok(len) if len <= buf.remaining() => Ok(len),
        _ => Err(DecodeError::Truncated(what)),
    }
}

fn expect_wire_type(field: u64, wire_type: u8, expected: u8) -> Result<(), DecodeError> {
    if wire_type != expected {
        return Err(DecodeError::WireTypeMismatch {
            field,
            wire_type,
            expected,
        });
    }
    Ok(())
}

fn skip_field<B: Buf>(buf: &mut B, field: u64, wire_type: u8) -> Result<(), DecodeError> {
    let len = match wire_type {
        WIRE_VARINT => {
            get_varint(buf, "unknown field")?;
            return Ok(());
        }
        WIRE_FIXED64 => 8,
        WIRE_FIXED32 => 4,
        WIRE_LEN => get_len(buf, "unknown field")?,
        _ => return Err(DecodeError::UnsupportedWireType { field, wire_type }),
    };
    if buf.remaining() < len {
        return Err(DecodeError::Truncated("unknown field"));
    }
    buf.advance(len);
    Ok(())
}
