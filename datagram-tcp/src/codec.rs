//! Builds outbound datagrams and vets inbound ones.
//!
//! The codec reads addressing and the sequence counter from a [`Tcb`] (the
//! per-connection control block) and produces sealed [`Datagram`]s.  On the
//! way in it answers two questions: was the datagram damaged in transit
//! ([`is_valid`]), and did it come from someone other than our peer
//! ([`is_ghost`])?
//!
//! Sequence numbers count datagrams, not bytes.  Data datagrams and the
//! SYN / SYN_ACK that open a connection consume one number each; ACKs and
//! FINs consume none.  The handshake ACK therefore never carries the number
//! of the first data datagram.

use std::net::IpAddr;

use crate::datagram::{Datagram, Flag};

/// Transmission control block: the addressing and sequence state of one
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tcb {
    pub local_addr: IpAddr,
    pub local_port: u16,
    /// Unset until connect is called or a SYN is accepted.
    pub remote_addr: Option<IpAddr>,
    pub remote_port: u16,
    /// Sequence number the next data datagram will carry.
    pub next_sequence_no: u32,
}

impl Tcb {
    pub fn new(local_addr: IpAddr, local_port: u16, isn: u32) -> Self {
        Self {
            local_addr,
            local_port,
            remote_addr: None,
            remote_port: 0,
            next_sequence_no: isn,
        }
    }

    /// Latch the origin of `datagram` as our remote endpoint.
    pub fn latch_remote(&mut self, datagram: &Datagram) {
        self.remote_addr = datagram.src_addr;
        self.remote_port = datagram.src_port;
    }
}

/// A control datagram (no payload) carrying the current sequence number.
pub fn build_control(tcb: &Tcb, flag: Flag) -> Datagram {
    let mut d = Datagram {
        flag,
        seq_nr: tcb.next_sequence_no,
        ack_nr: 0,
        src_addr: Some(tcb.local_addr),
        src_port: tcb.local_port,
        dest_addr: tcb.remote_addr,
        dest_port: tcb.remote_port,
        payload: None,
        checksum: 0,
    };
    d.seal();
    d
}

/// A control datagram with `flag` acknowledging `acked`.
pub fn build_reply(tcb: &Tcb, flag: Flag, acked: &Datagram) -> Datagram {
    let mut d = build_control(tcb, flag);
    d.ack_nr = acked.seq_nr;
    d.seal();
    d
}

/// A SYN (`acked` is `None`) or SYN_ACK.  Consumes the current sequence
/// number and advances it.
pub fn build_syn(tcb: &mut Tcb, flag: Flag, acked: Option<&Datagram>) -> Datagram {
    let d = match acked {
        Some(acked) => build_reply(tcb, flag, acked),
        None => build_control(tcb, flag),
    };
    tcb.next_sequence_no = tcb.next_sequence_no.wrapping_add(1);
    d
}

/// A pure ACK for `acked`.  Consumes no sequence number.
pub fn build_ack(tcb: &Tcb, acked: &Datagram) -> Datagram {
    build_reply(tcb, Flag::Ack, acked)
}

/// A data datagram.  Consumes the current sequence number and advances it.
pub fn build_data(tcb: &mut Tcb, payload: Vec<u8>) -> Datagram {
    let mut d = build_control(tcb, Flag::None);
    d.payload = Some(payload);
    d.seal();
    tcb.next_sequence_no = tcb.next_sequence_no.wrapping_add(1);
    d
}

/// Checksum over every field except the stored checksum.
pub fn checksum(datagram: &Datagram) -> u32 {
    datagram.calculate_checksum()
}

/// `true` when the stored checksum matches the datagram's fields.
pub fn is_valid(datagram: &Datagram) -> bool {
    datagram.checksum == checksum(datagram)
}

/// `true` when `datagram` did not come from the connection's remote endpoint.
///
/// A datagram without a source address is always a ghost, as is anything
/// received before a remote endpoint has been recorded.
pub fn is_ghost(tcb: &Tcb, datagram: &Datagram) -> bool {
    match (datagram.src_addr, tcb.remote_addr) {
        (Some(src), Some(remote)) => src != remote || datagram.src_port != tcb.remote_port,
        _ => true,
    }
}

/// Returns `true` when sequence number `a` precedes `b` in wrap-around space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) <= (u32::MAX / 2)
}
