//! Wire-format definitions for protocol datagrams.
//!
//! Every unit exchanged between peers is a [`Datagram`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (control flag, sequence numbers,
//!   addressing, payload, checksum).
//! - Serialising a [`Datagram`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Datagram`], returning errors
//!   for malformed or truncated input.
//! - Computing the checksum that lets a receiver detect corruption.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! Decoding deliberately does **not** reject a datagram whose checksum fails.
//! The connection layer has to see corrupt datagrams so it can re-acknowledge
//! the last good one; see [`Datagram::is_valid`].
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.  Addresses are carried as
//! 16-byte IPv6 addresses (IPv4 is IPv4-mapped); the unspecified address
//! `::` means "absent".
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flag      |  Has payload  |     Sequence Number (hi)      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Sequence Number (lo)      |    Acknowledgment Number (hi) |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Acknowledgment Number (lo)  |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               +
//! |                  Source Address (16 bytes)                    |
//! +                               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                               |          Source Port          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               Destination Address (16 bytes)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       Destination Port        |        Payload Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Checksum (CRC-32)                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 52 bytes.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 52;

/// Largest payload that still fits in a single UDP datagram with our header.
pub const MAX_PAYLOAD: usize = 65_507 - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_FLAG: usize = 0;
const OFF_HAS_PAYLOAD: usize = 1;
const OFF_SEQ: usize = 2;
const OFF_ACK: usize = 6;
const OFF_SRC_ADDR: usize = 10;
const OFF_SRC_PORT: usize = 26;
const OFF_DEST_ADDR: usize = 28;
const OFF_DEST_PORT: usize = 44;
const OFF_PAYLOAD_LEN: usize = 46;
const OFF_CHECKSUM: usize = 48;

// ---------------------------------------------------------------------------
// Flag
// ---------------------------------------------------------------------------

/// Control-type tag of a datagram.  Plain data carries [`Flag::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    None,
    Syn,
    SynAck,
    Ack,
    Fin,
    FinAck,
}

impl Flag {
    fn to_wire(self) -> u8 {
        match self {
            Flag::None => 0,
            Flag::Syn => 1,
            Flag::SynAck => 2,
            Flag::Ack => 3,
            Flag::Fin => 4,
            Flag::FinAck => 5,
        }
    }

    fn from_wire(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Flag::None,
            1 => Flag::Syn,
            2 => Flag::SynAck,
            3 => Flag::Ack,
            4 => Flag::Fin,
            5 => Flag::FinAck,
            _ => return None,
        })
    }

    /// `true` for flags that carry a meaningful `ack_nr`.
    pub fn acknowledges(self) -> bool {
        matches!(self, Flag::Ack | Flag::SynAck | Flag::FinAck)
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Flag::None => "DATA",
            Flag::Syn => "SYN",
            Flag::SynAck => "SYN_ACK",
            Flag::Ack => "ACK",
            Flag::Fin => "FIN",
            Flag::FinAck => "FIN_ACK",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Datagram
// ---------------------------------------------------------------------------

/// A complete protocol datagram: addressing, control fields and payload.
///
/// `checksum` is whatever was stored at send time (or read off the wire).
/// It is only trustworthy after comparing it with
/// [`Datagram::calculate_checksum`], which [`Datagram::is_valid`] does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub flag: Flag,
    /// Sequence number of this datagram.
    pub seq_nr: u32,
    /// Sequence number being acknowledged (ACK-bearing flags only).
    pub ack_nr: u32,
    pub src_addr: Option<IpAddr>,
    pub src_port: u16,
    pub dest_addr: Option<IpAddr>,
    pub dest_port: u16,
    /// Present on data datagrams, absent on pure control datagrams.
    pub payload: Option<Vec<u8>>,
    pub checksum: u32,
}

impl Datagram {
    /// Checksum over every field except `checksum` itself.
    ///
    /// Computed over the serialised form, so it is stable across
    /// encode / decode.
    pub fn calculate_checksum(&self) -> u32 {
        checksum_of(&self.encode())
    }

    /// Store the freshly computed checksum.  Call after the last field change.
    pub fn seal(&mut self) {
        self.checksum = self.calculate_checksum();
    }

    /// `true` when the stored checksum matches the current field values.
    pub fn is_valid(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// Payload bytes, or an empty slice for control datagrams.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// Serialise this datagram into a newly allocated byte vector.
    ///
    /// The stored `checksum` is written as-is; call [`seal`](Self::seal)
    /// first when building an outbound datagram.  At most [`MAX_PAYLOAD`]
    /// payload bytes are written; channels refuse longer payloads before
    /// they get here.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload_bytes();
        let payload = &payload[..payload.len().min(MAX_PAYLOAD)];
        let mut buf = vec![0u8; HEADER_LEN + payload.len()];

        buf[OFF_FLAG] = self.flag.to_wire();
        buf[OFF_HAS_PAYLOAD] = u8::from(self.payload.is_some());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq_nr.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack_nr.to_be_bytes());
        put_addr(&mut buf[OFF_SRC_ADDR..OFF_SRC_ADDR + 16], self.src_addr);
        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.src_port.to_be_bytes());
        put_addr(&mut buf[OFF_DEST_ADDR..OFF_DEST_ADDR + 16], self.dest_addr);
        buf[OFF_DEST_PORT..OFF_DEST_PORT + 2].copy_from_slice(&self.dest_port.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload.len() as u16).to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&self.checksum.to_be_bytes());

        buf[HEADER_LEN..].copy_from_slice(payload);
        buf
    }

    /// Parse a [`Datagram`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the flag byte is not a known [`Flag`], or
    /// - the `payload_len` field disagrees with `buf.len()`.
    ///
    /// The checksum is read but not verified.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::BufferTooShort);
        }

        let flag = Flag::from_wire(buf[OFF_FLAG]).ok_or(DecodeError::UnknownFlag(buf[OFF_FLAG]))?;
        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN) as usize;
        if buf.len() != HEADER_LEN + payload_len {
            return Err(DecodeError::LengthMismatch);
        }
        let payload = (buf[OFF_HAS_PAYLOAD] != 0).then(|| buf[HEADER_LEN..].to_vec());

        Ok(Datagram {
            flag,
            seq_nr: read_u32(buf, OFF_SEQ),
            ack_nr: read_u32(buf, OFF_ACK),
            src_addr: get_addr(&buf[OFF_SRC_ADDR..OFF_SRC_ADDR + 16]),
            src_port: read_u16(buf, OFF_SRC_PORT),
            dest_addr: get_addr(&buf[OFF_DEST_ADDR..OFF_DEST_ADDR + 16]),
            dest_port: read_u16(buf, OFF_DEST_PORT),
            payload,
            checksum: read_u32(buf, OFF_CHECKSUM),
        })
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("unknown control flag {0:#04x}")]
    UnknownFlag(u8),
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
}

/// CRC-32 over an encoded datagram, skipping the checksum field.
fn checksum_of(encoded: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&encoded[..OFF_CHECKSUM]);
    hasher.update(&encoded[HEADER_LEN..]);
    hasher.finalize()
}

fn put_addr(dst: &mut [u8], addr: Option<IpAddr>) {
    let v6 = match addr {
        None => Ipv6Addr::UNSPECIFIED,
        Some(IpAddr::V4(v4)) => v4.to_ipv6_mapped(),
        Some(IpAddr::V6(v6)) => v6,
    };
    dst.copy_from_slice(&v6.octets());
}

fn get_addr(src: &[u8]) -> Option<IpAddr> {
    let octets: [u8; 16] = src.try_into().ok()?;
    let v6 = Ipv6Addr::from(octets);
    if v6.is_unspecified() {
        None
    } else if let Some(v4) = v6.to_ipv4_mapped() {
        Some(IpAddr::V4(v4))
    } else {
        Some(IpAddr::V6(v6))
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
