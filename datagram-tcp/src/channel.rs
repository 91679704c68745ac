//! The unreliable datagram channel the protocol runs on.
//!
//! A [`Channel`] may drop, duplicate, reorder or corrupt datagrams, and may
//! deliver datagrams from senders the connection has never heard of.  None of
//! that is reported as an error; [`ChannelError`] is reserved for genuine
//! faults of the primitive itself (e.g. an OS socket error).
//!
//! Two implementations ship with the crate:
//! - [`crate::socket::UdpChannel`]: real UDP sockets.
//! - [`crate::simulator::SimNetwork`]: in-memory, with fault injection.

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::datagram::{Datagram, MAX_PAYLOAD};

/// Errors raised by the channel primitive itself.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datagram has no destination address")]
    NoDestination,
    #[error("payload of {0} bytes does not fit in one datagram")]
    Oversized(usize),
}

/// Reject a payload that [`Datagram::encode`] would cut short.
pub(crate) fn ensure_fits(datagram: &Datagram) -> Result<(), ChannelError> {
    match datagram.payload_bytes().len() {
        len if len > MAX_PAYLOAD => Err(ChannelError::Oversized(len)),
        _ => Ok(()),
    }
}

/// Best-effort datagram transport addressed by local port.
pub trait Channel: Send + Sync + 'static {
    /// Address connections on this channel use as their local address.
    fn local_addr(&self) -> IpAddr;

    /// Hand `datagram` to the network.  Success says nothing about delivery.
    fn send(&self, datagram: &Datagram) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Wait up to `timeout` for the next datagram addressed to `port`.
    ///
    /// Returns `Ok(None)` when the timeout expires.  The datagram may come
    /// from anyone; callers filter by origin.
    fn receive(
        &self,
        port: u16,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Datagram>, ChannelError>> + Send;

    /// Release whatever the channel holds for `port`.  Called when the
    /// connection owning the port is dropped.
    fn unbind(&self, _port: u16) {}
}
