//! UDP implementation of [`Channel`].
//!
//! [`UdpChannel`] owns one `tokio::net::UdpSocket` per local port and speaks
//! [`Datagram`] instead of raw bytes.  All protocol logic lives elsewhere;
//! this module owns only byte I/O.
//!
//! Sockets are bound lazily: the first send from, or receive on, a port binds
//! it.  Servers should call [`UdpChannel::bind`] on their listening port up
//! front so SYNs that arrive before the first `accept` are queued by the OS.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::channel::{self, Channel, ChannelError};
use crate::datagram::Datagram;

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

/// A set of UDP sockets on one local IP address, keyed by port.
#[derive(Debug)]
pub struct UdpChannel {
    /// Address sockets are bound to.
    bind_ip: IpAddr,
    /// Address written into outbound datagrams as their source.
    public_ip: IpAddr,
    sockets: Mutex<HashMap<u16, Arc<UdpSocket>>>,
}

impl UdpChannel {
    /// Channel bound to `ip`, advertising the same address to peers.
    pub fn new(ip: IpAddr) -> Self {
        Self {
            bind_ip: ip,
            public_ip: ip,
            sockets: Mutex::new(HashMap::new()),
        }
    }

    /// Advertise `ip` as the source address.  Needed when binding a wildcard
    /// address, which peers cannot match against.
    pub fn with_public_addr(mut self, ip: IpAddr) -> Self {
        self.public_ip = ip;
        self
    }

    /// Bind `port` now (no-op when already bound) and return its socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(&self, port: u16) -> Result<Arc<UdpSocket>, ChannelError> {
        let mut sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = sockets.get(&port) {
            return Ok(Arc::clone(socket));
        }
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(self.bind_ip, port))?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        log::debug!("[udp] bound {}:{port}", self.bind_ip);
        sockets.insert(port, Arc::clone(&socket));
        Ok(socket)
    }
}

impl Channel for UdpChannel {
    fn local_addr(&self) -> IpAddr {
        self.public_ip
    }

    async fn send(&self, datagram: &Datagram) -> Result<(), ChannelError> {
        let dest_ip = datagram.dest_addr.ok_or(ChannelError::NoDestination)?;
        channel::ensure_fits(datagram)?;
        let socket = self.bind(datagram.src_port)?;
        let dest = SocketAddr::new(dest_ip, datagram.dest_port);
        socket.send_to(&datagram.encode(), dest).await?;
        Ok(())
    }

    /// Datagrams that fail to decode are line noise; they are dropped and the
    /// wait continues until the deadline.
    async fn receive(&self, port: u16, timeout: Duration) -> Result<Option<Datagram>, ChannelError> {
        let socket = self.bind(port)?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(result) => result?,
                Err(_elapsed) => return Ok(None),
            };
            match Datagram::decode(&buf[..n]) {
                Ok(datagram) => return Ok(Some(datagram)),
                Err(e) => log::debug!("[udp] dropping {n} bytes from {from}: {e}"),
            }
        }
    }

    fn unbind(&self, port: u16) {
        let mut sockets = self.sockets.lock().unwrap_or_else(PoisonError::into_inner);
        if sockets.remove(&port).is_some() {
            log::debug!("[udp] unbound {}:{port}", self.bind_ip);
        }
    }
}
