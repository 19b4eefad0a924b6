//! Frame codec
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

//! Wire layout (big-endian):
//!
//! ```text
//! | control (2) | destination (2) | source (2) | payload (0..2038) | crc32 (4) |
//! control = kind (3 bits) | retry (1 bit) | sequence (12 bits)
//! ```

use core::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{Address, Ts};

/// Sequence numbers are 12 bits wide
pub const SEQ_MODULUS: u16 = 4096;
pub const SEQ_MASK: u16 = SEQ_MODULUS - 1;

pub const HEADER_LEN: usize = 6;
pub const CRC_LEN: usize = 4;
/// Bytes added to every payload on the wire
pub const FRAME_OVERHEAD: usize = HEADER_LEN + CRC_LEN;
/// Largest frame the channel will carry
pub const MAX_FRAME_LEN: usize = 2048;
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_OVERHEAD;

/// Length of a beacon timestamp payload
pub const BEACON_LEN: usize = 8;

/// Frame types carried in the top three control bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Kind {
    Data = 0,
    Ack = 1,
    Beacon = 2,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// Buffer shorter than the fixed frame overhead
    #[error("not enough bytes ({0}) for a frame")]
    NotEnoughBytes(usize),

    /// Checksum did not match, nothing else in the frame can be trusted
    #[error("bad checksum: expected {expected:#010x}, computed {actual:#010x}")]
    BadChecksum {
        expected: u32,
        actual: u32,
    },

    /// Intact frame of a type this MAC does not implement
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
}

/// A single MAC frame with owned payload storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: Kind,
    pub retry: bool,
    pub seq: u16,
    pub dest: Address,
    pub source: Address,

    payload: Bytes,
}

impl Frame {
    pub fn new(kind: Kind, seq: u16, dest: Address, source: Address, payload: Bytes) -> Frame {
        Frame {
            kind,
            retry: false,
            seq: seq & SEQ_MASK,
            dest,
            source,
            payload,
        }
    }

    pub fn data(dest: Address, source: Address, seq: u16, data: &[u8]) -> Frame {
        Frame::new(Kind::Data, seq, dest, source, Bytes::copy_from_slice(data))
    }

    /// Broadcast beacon carrying the sender's network time
    pub fn beacon(source: Address, seq: u16, time: Ts) -> Frame {
        let mut buff = [0u8; BEACON_LEN];
        BigEndian::write_u64(&mut buff, time);

        Frame::new(Kind::Beacon, seq, Address::BROADCAST, source, Bytes::copy_from_slice(&buff))
    }

    /// Generate an ACK for the provided frame
    pub fn ack(request: &Frame) -> Frame {
        Frame::new(Kind::Ack, request.seq, request.source, request.dest, Bytes::new())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Shared handle to the payload
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Timestamp carried by a well formed beacon
    pub fn beacon_time(&self) -> Option<Ts> {
        match (self.kind, self.payload.len()) {
            (Kind::Beacon, BEACON_LEN) => Some(BigEndian::read_u64(&self.payload)),
            _ => None,
        }
    }

    // Check whether this frame is an ack for the provided frame
    pub fn is_ack_for(&self, original: &Frame) -> bool {
        self.kind == Kind::Ack &&
        original.kind == Kind::Data &&
        self.source == original.dest &&
        self.dest == original.source &&
        self.seq == original.seq
    }

    fn control(&self) -> u16 {
        ((self.kind as u16) << 13) | ((self.retry as u16) << 12) | (self.seq & SEQ_MASK)
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Encode to wire format, appending the CRC over all preceding bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        buf.put_u16(self.control());
        buf.put_u16(self.dest.0);
        buf.put_u16(self.source.0);
        buf.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);

        buf.freeze()
    }

    /// Decode from wire format.
    ///
    /// The checksum is validated before any other field is read, a corrupt
    /// frame yields [`DecodeError::BadChecksum`].
    pub fn decode(buf: &[u8]) -> Result<Frame, DecodeError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(DecodeError::NotEnoughBytes(buf.len()));
        }

        let body_len = buf.len() - CRC_LEN;
        let expected = BigEndian::read_u32(&buf[body_len..]);
        let actual = crc32fast::hash(&buf[..body_len]);
        if expected != actual {
            return Err(DecodeError::BadChecksum { expected, actual });
        }

        let control = BigEndian::read_u16(&buf[0..2]);
        let kind_bits = (control >> 13) as u8;
        let kind = Kind::from_repr(kind_bits).ok_or(DecodeError::UnknownKind(kind_bits))?;

        Ok(Frame {
            kind,
            retry: control & (1 << 12) != 0,
            seq: control & SEQ_MASK,
            dest: Address(BigEndian::read_u16(&buf[2..4])),
            source: Address(BigEndian::read_u16(&buf[4..6])),
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..body_len]),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {} {}->{}{} [{} bytes]>",
            self.kind, self.seq, self.source, self.dest,
            if self.retry { " retry" } else { "" },
            self.payload.len())
    }
}
