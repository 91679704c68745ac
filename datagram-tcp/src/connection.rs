//! Per-connection lifecycle manager.
//!
//! A [`Connection`] owns the complete state for one logical peer-to-peer
//! session over a [`Channel`].  Its responsibilities are:
//! - Driving the finite-state machine (see [`crate::state`]).
//! - Building and vetting datagrams through [`crate::codec`].
//! - Stop-and-wait transfer: one data datagram in flight, retransmitted on
//!   timeout until acknowledged or the retry budget runs out.
//! - Filtering ghosts (datagrams from anyone but the peer) and corrupted
//!   datagrams without surfacing them as errors.
//!
//! Connections are created either closed ([`Connection::open`], for an active
//! open) or listening ([`Connection::listen`]).  A listener never carries
//! data: every accepted SYN is handed to a new connection on a fresh port.
//!
//! ```text
//!   client                              listener :9000        child :49152
//!     │ ── SYN ──────────────────────────▶ │
//!     │                                    │ allocate port ──▶ │
//!     │ ◀──────────────────────────────── SYN_ACK (ack=isn) ── │
//!     │ ── ACK ──────────────────────────────────────────────▶ │
//!     │ ══ DATA / ACK / FIN ═══════════════════════════════════ │
//! ```
//!
//! Retry budget: each call to `send`, `receive` or `close` starts from zero.
//! Only expired waits count against it; ghosts, corrupted datagrams and stale
//! acknowledgements never do.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelError};
use crate::codec::{self, Tcb};
use crate::config::{ConnectionConfig, HandshakeCheck};
use crate::datagram::{Datagram, Flag, MAX_PAYLOAD};
use crate::ports::{PortAllocator, PortError, PortLease};
use crate::state::{self, ConnectionState, Effect, Event, IllegalTransition};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by [`Connection`] operations.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("operation not permitted in state {0}")]
    InvalidState(ConnectionState),

    #[error("handshake timed out")]
    Timeout,

    #[error("connection is not established")]
    NotConnected,

    #[error("retry budget exhausted; connection lost")]
    ConnectionLost,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("close is not supported in state {0}")]
    Unsupported(ConnectionState),

    #[error("payload of {0} bytes exceeds the datagram limit")]
    PayloadTooLarge(usize),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The listening port itself can no longer receive.
    #[error("listener failed: {0}")]
    Listener(#[source] ChannelError),

    #[error(transparent)]
    Port(#[from] PortError),
}

impl From<IllegalTransition> for ConnError {
    fn from(e: IllegalTransition) -> Self {
        ConnError::InvalidState(e.state)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A handle to a single connection over an unreliable [`Channel`].
pub struct Connection<C: Channel> {
    channel: Arc<C>,
    ports: Arc<PortAllocator>,
    /// Returns the local port to `ports` when the connection is dropped.
    _lease: PortLease,
    tcb: Tcb,
    state: ConnectionState,
    config: ConnectionConfig,

    /// Most recent in-order data datagram delivered to the application.
    last_datagram_received: Option<Datagram>,
    /// The peer's FIN, once seen.
    peer_fin: Option<Datagram>,

    send_retries: u32,
    receive_retries: u32,
    close_retries: u32,
}

impl<C: Channel> Connection<C> {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    /// A `CLOSED` connection on a freshly allocated local port, ready for
    /// [`connect`](Self::connect).
    pub fn open(
        channel: Arc<C>,
        ports: Arc<PortAllocator>,
        config: ConnectionConfig,
    ) -> Result<Self, ConnError> {
        let lease = ports.allocate()?;
        Ok(Self::with_lease(channel, ports, lease, ConnectionState::Closed, config))
    }

    /// A `LISTEN`ing connection on `port`, ready for [`accept`](Self::accept).
    pub fn listen(
        channel: Arc<C>,
        ports: Arc<PortAllocator>,
        port: u16,
        config: ConnectionConfig,
    ) -> Result<Self, ConnError> {
        let lease = ports.reserve(port)?;
        log::info!("[conn:{port}] listening");
        Ok(Self::with_lease(channel, ports, lease, ConnectionState::Listen, config))
    }

    fn with_lease(
        channel: Arc<C>,
        ports: Arc<PortAllocator>,
        lease: PortLease,
        state: ConnectionState,
        config: ConnectionConfig,
    ) -> Self {
        let tcb = Tcb::new(channel.local_addr(), lease.port(), rand::random());
        Self {
            channel,
            ports,
            _lease: lease,
            tcb,
            state,
            config,
            last_datagram_received: None,
            peer_fin: None,
            send_retries: 0,
            receive_retries: 0,
            close_retries: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Addressing and sequence state.
    pub fn tcb(&self) -> &Tcb {
        &self.tcb
    }

    pub fn local_addr(&self) -> IpAddr {
        self.tcb.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.tcb.local_port
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.tcb.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.tcb.remote_port
    }

    /// Sequence number the next data datagram will carry.
    pub fn next_sequence_no(&self) -> u32 {
        self.tcb.next_sequence_no
    }

    pub fn last_datagram_received(&self) -> Option<&Datagram> {
        self.last_datagram_received.as_ref()
    }

    /// Retransmissions made by the most recent `send`.
    pub fn send_retries(&self) -> u32 {
        self.send_retries
    }

    /// Expired waits during the most recent `receive`.
    pub fn receive_retries(&self) -> u32 {
        self.receive_retries
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Active open: send a SYN to `addr:port` and wait one timeout for the
    /// SYN_ACK.  The SYN_ACK normally comes from a different port than the
    /// one dialled; its origin becomes the remote endpoint.
    pub async fn connect(&mut self, addr: IpAddr, port: u16) -> Result<(), ConnError> {
        if self.state != ConnectionState::Closed {
            return Err(ConnError::InvalidState(self.state));
        }
        self.tcb.remote_addr = Some(addr);
        self.tcb.remote_port = port;
        self.last_datagram_received = None;
        self.peer_fin = None;

        log::info!("[conn:{}] connecting to {addr}:{port}", self.tcb.local_port);
        self.step(Event::Connect, None).await?;

        let deadline = Instant::now() + self.config.timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let Some(reply) = self.next_datagram(wait).await? else {
                log::warn!("[conn:{}] no SYN_ACK from {addr}:{port}", self.tcb.local_port);
                self.step(Event::Timeout, None).await?;
                return Err(ConnError::Timeout);
            };
            if reply.flag != Flag::SynAck {
                self.ignore(&reply, "waiting for SYN_ACK");
                continue;
            }
            if self.config.handshake_check == HandshakeCheck::Strict
                && !(codec::is_valid(&reply) && reply.src_addr == Some(addr))
            {
                self.ignore(&reply, "SYN_ACK failed strict checks");
                continue;
            }

            self.tcb.latch_remote(&reply);
            self.step(Event::SynAckReceived, Some(&reply)).await?;
            log::info!(
                "[conn:{}] established with {addr}:{}",
                self.tcb.local_port,
                self.tcb.remote_port
            );
            return Ok(());
        }
    }

    /// Passive open: wait for a SYN and hand the peer to a new connection on
    /// a freshly allocated port.
    ///
    /// The listener is back in `LISTEN` when this returns, whether or not the
    /// new connection completed its handshake.  Errors that concern only
    /// that peer (no free port, a failed send, `Timeout`) leave the listener
    /// usable; [`ConnError::Listener`] means the listening port is broken.
    pub async fn accept(&mut self) -> Result<Connection<C>, ConnError> {
        if self.state != ConnectionState::Listen {
            return Err(ConnError::InvalidState(self.state));
        }

        let syn = loop {
            let d = match self.next_datagram(self.config.timeout).await {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(ConnError::Channel(e)) => return Err(ConnError::Listener(e)),
                Err(e) => return Err(e),
            };
            if d.flag != Flag::Syn {
                self.ignore(&d, "listening");
                continue;
            }
            // Nowhere to send the SYN_ACK.
            if d.src_addr.is_none() {
                self.ignore(&d, "SYN without source address");
                continue;
            }
            if self.config.handshake_check == HandshakeCheck::Strict && !codec::is_valid(&d) {
                self.ignore(&d, "SYN failed strict checks");
                continue;
            }
            break d;
        };

        self.step(Event::SynReceived, Some(&syn)).await?;
        let child = self.spawn_child(&syn).await;
        self.step(Event::Spawned, None).await?;
        child
    }

    async fn spawn_child(&self, syn: &Datagram) -> Result<Connection<C>, ConnError> {
        let lease = self.ports.allocate()?;
        let mut child = Connection::with_lease(
            Arc::clone(&self.channel),
            Arc::clone(&self.ports),
            lease,
            ConnectionState::SynReceived,
            self.config,
        );
        child.tcb.latch_remote(syn);
        child.answer_syn(syn).await?;
        Ok(child)
    }

    /// Spawned side of the handshake: SYN_ACK the peer and wait one timeout
    /// for its ACK.
    async fn answer_syn(&mut self, syn: &Datagram) -> Result<(), ConnError> {
        let syn_ack = codec::build_syn(&mut self.tcb, Flag::SynAck, Some(syn));
        self.transmit(&syn_ack).await?;

        let deadline = Instant::now() + self.config.timeout;
        match self.await_reply(deadline, |d| d.flag == Flag::Ack).await? {
            Some(_) => {
                self.step(Event::AckReceived, None).await?;
                log::info!(
                    "[conn:{}] accepted {:?}:{}",
                    self.tcb.local_port,
                    self.tcb.remote_addr,
                    self.tcb.remote_port
                );
                Ok(())
            }
            None => {
                log::warn!("[conn:{}] handshake ACK never arrived", self.tcb.local_port);
                self.step(Event::Timeout, None).await?;
                Err(ConnError::Timeout)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Send `payload` as one data datagram and wait for its acknowledgement,
    /// retransmitting on timeout up to `max_retries` times.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ConnError> {
        if self.state != ConnectionState::Established {
            return Err(ConnError::NotConnected);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(ConnError::PayloadTooLarge(payload.len()));
        }

        self.send_retries = 0;
        let datagram = codec::build_data(&mut self.tcb, payload.to_vec());
        let seq = datagram.seq_nr;

        loop {
            self.transmit(&datagram).await?;

            // ACKs beyond `seq` cannot be for anything we sent.
            let deadline = Instant::now() + self.config.timeout;
            let reply = self
                .await_reply(deadline, |d| d.flag == Flag::Ack && !codec::seq_lt(seq, d.ack_nr))
                .await?;

            match reply {
                Some(ack) if ack.ack_nr == seq => return Ok(()),
                Some(ack) => {
                    // The peer is still on the previous datagram; resend under
                    // the same sequence number.
                    log::debug!(
                        "[conn:{}] stale ACK ack={} for seq={seq}",
                        self.tcb.local_port,
                        ack.ack_nr
                    );
                }
                None if self.send_retries < self.config.max_retries => {
                    self.send_retries += 1;
                    log::debug!(
                        "[conn:{}] timeout, retransmitting seq={seq} ({}/{})",
                        self.tcb.local_port,
                        self.send_retries,
                        self.config.max_retries
                    );
                }
                None => {
                    log::warn!(
                        "[conn:{}] seq={seq} unacknowledged after {} retries",
                        self.tcb.local_port,
                        self.send_retries
                    );
                    self.abort();
                    return Err(ConnError::ConnectionLost);
                }
            }
        }
    }

    /// Wait for the next in-order data datagram and return its payload.
    ///
    /// Returns [`ConnError::PeerClosed`] once the peer's FIN has arrived, and
    /// on every call after that.
    pub async fn receive(&mut self) -> Result<Vec<u8>, ConnError> {
        match self.state {
            ConnectionState::Established => {}
            ConnectionState::CloseWait => return Err(ConnError::PeerClosed),
            _ => return Err(ConnError::NotConnected),
        }

        self.receive_retries = 0;
        loop {
            let Some(d) = self.next_datagram(self.config.timeout).await? else {
                if self.receive_retries < self.config.max_retries {
                    self.receive_retries += 1;
                    continue;
                }
                log::warn!(
                    "[conn:{}] nothing received after {} retries",
                    self.tcb.local_port,
                    self.receive_retries
                );
                self.abort();
                return Err(ConnError::ConnectionLost);
            };

            if codec::is_ghost(&self.tcb, &d) {
                self.ignore(&d, "ghost");
                continue;
            }
            if !codec::is_valid(&d) {
                log::debug!("[conn:{}] ← corrupted datagram", self.tcb.local_port);
                self.reack_last().await?;
                continue;
            }

            match d.flag {
                Flag::Fin => {
                    log::debug!("[conn:{}] ← FIN seq={}", self.tcb.local_port, d.seq_nr);
                    self.peer_fin = Some(d.clone());
                    self.step(Event::FinReceived, Some(&d)).await?;
                    return Err(ConnError::PeerClosed);
                }
                Flag::None => {}
                _ => {
                    self.ignore(&d, "waiting for data");
                    continue;
                }
            }

            let in_order = self
                .last_datagram_received
                .as_ref()
                .map_or(true, |last| d.seq_nr == last.seq_nr.wrapping_add(1));
            if !in_order {
                log::debug!("[conn:{}] ← out-of-order seq={}", self.tcb.local_port, d.seq_nr);
                self.reack_last().await?;
                continue;
            }

            self.send_ack(&d).await?;
            let payload = d.payload.clone().unwrap_or_default();
            self.last_datagram_received = Some(d);
            return Ok(payload);
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Close the connection.
    ///
    /// From `ESTABLISHED` this is the active close (FIN, wait for its ACK,
    /// then wait for the peer's FIN).  From `CLOSE_WAIT` it is the passive
    /// close (ACK the peer's FIN, pause, FIN, wait once for its ACK).  Both
    /// end in `CLOSED` even when the peer stops answering.
    pub async fn close(&mut self) -> Result<(), ConnError> {
        self.close_retries = 0;
        match self.state {
            ConnectionState::Established => self.active_close().await,
            ConnectionState::CloseWait => self.passive_close().await,
            state => Err(ConnError::Unsupported(state)),
        }
    }

    async fn active_close(&mut self) -> Result<(), ConnError> {
        let fin_seq = self.tcb.next_sequence_no;

        loop {
            self.step(Event::Close, None).await?;

            let deadline = Instant::now() + self.config.timeout;
            let reply = self
                .await_reply(deadline, |d| {
                    d.flag == Flag::Fin || (d.flag == Flag::Ack && d.ack_nr == fin_seq)
                })
                .await?;

            match reply {
                Some(ack) if ack.flag == Flag::Ack => break,
                // The peer's FIN implies it saw ours.
                Some(fin) => {
                    self.peer_fin = Some(fin.clone());
                    self.step(Event::FinReceived, Some(&fin)).await?;
                    return Ok(());
                }
                None if self.close_retries < self.config.max_retries => {
                    self.close_retries += 1;
                    self.step(Event::Timeout, None).await?;
                }
                None => {
                    log::warn!("[conn:{}] FIN not ACKed; force-closing", self.tcb.local_port);
                    self.abort();
                    return Ok(());
                }
            }
        }

        self.step(Event::AckReceived, None).await?;

        loop {
            let deadline = Instant::now() + self.config.timeout;
            let reply = self
                .await_reply(deadline, |d| matches!(d.flag, Flag::Fin | Flag::FinAck))
                .await?;

            match reply {
                Some(fin) => {
                    self.peer_fin = Some(fin.clone());
                    self.step(Event::FinReceived, Some(&fin)).await?;
                    return Ok(());
                }
                None if self.close_retries < self.config.max_retries => self.close_retries += 1,
                None => {
                    log::warn!("[conn:{}] peer never sent FIN", self.tcb.local_port);
                    self.step(Event::Timeout, None).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn passive_close(&mut self) -> Result<(), ConnError> {
        if let Some(fin) = self.peer_fin.clone() {
            self.send_ack(&fin).await?;
        }
        tokio::time::sleep(self.config.close_pause).await;

        let fin_seq = self.tcb.next_sequence_no;
        self.step(Event::Close, None).await?;

        let deadline = Instant::now() + self.config.timeout;
        let reply = self
            .await_reply(deadline, |d| d.flag == Flag::Ack && d.ack_nr == fin_seq)
            .await?;
        let event = match reply {
            Some(_) => Event::AckReceived,
            None => {
                log::warn!("[conn:{}] last ACK never arrived", self.tcb.local_port);
                Event::Timeout
            }
        };
        self.step(event, None).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Feed `event` through the FSM and perform the resulting effect.
    /// `cause` is the datagram an ACK effect acknowledges.
    async fn step(&mut self, event: Event, cause: Option<&Datagram>) -> Result<(), ConnError> {
        let (next, effect) = state::transition(self.state, event)?;
        self.set_state(next);

        match effect {
            Effect::Nothing => Ok(()),
            Effect::SendSyn => {
                let syn = codec::build_syn(&mut self.tcb, Flag::Syn, None);
                self.transmit(&syn).await
            }
            Effect::SendFin => {
                let fin = codec::build_control(&self.tcb, Flag::Fin);
                self.transmit(&fin).await
            }
            Effect::SendAck => match cause {
                Some(acked) => self.send_ack(acked).await,
                None => Ok(()),
            },
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if next != self.state {
            log::debug!("[conn:{}] {} → {}", self.tcb.local_port, self.state, next);
            self.state = next;
        }
    }

    /// Drop to `CLOSED` after an unrecoverable failure.  A listener stays put.
    fn abort(&mut self) {
        if let Ok((next, _)) = state::transition(self.state, Event::Abort) {
            self.set_state(next);
        }
    }

    async fn transmit(&mut self, datagram: &Datagram) -> Result<(), ConnError> {
        if datagram.flag.acknowledges() {
            log::debug!(
                "[conn:{}] → {} seq={} ack={}",
                self.tcb.local_port,
                datagram.flag,
                datagram.seq_nr,
                datagram.ack_nr
            );
        } else {
            log::debug!(
                "[conn:{}] → {} seq={} len={}",
                self.tcb.local_port,
                datagram.flag,
                datagram.seq_nr,
                datagram.payload_bytes().len()
            );
        }
        if let Err(e) = self.channel.send(datagram).await {
            self.abort();
            return Err(e.into());
        }
        Ok(())
    }

    async fn send_ack(&mut self, acked: &Datagram) -> Result<(), ConnError> {
        let ack = codec::build_ack(&self.tcb, acked);
        self.transmit(&ack).await
    }

    /// Repeat the acknowledgement of the last delivered datagram, if any.
    async fn reack_last(&mut self) -> Result<(), ConnError> {
        match self.last_datagram_received.clone() {
            Some(last) => self.send_ack(&last).await,
            None => Ok(()),
        }
    }

    async fn next_datagram(&mut self, wait: Duration) -> Result<Option<Datagram>, ConnError> {
        match self.channel.receive(self.tcb.local_port, wait).await {
            Ok(received) => Ok(received),
            Err(e) => {
                self.abort();
                Err(e.into())
            }
        }
    }

    /// Wait until `deadline` for a valid datagram from the peer that `wanted`
    /// selects.  Anything else is discarded, except retransmissions of data or
    /// FINs we already acknowledged, which are acknowledged again.
    async fn await_reply<F>(
        &mut self,
        deadline: Instant,
        wanted: F,
    ) -> Result<Option<Datagram>, ConnError>
    where
        F: Fn(&Datagram) -> bool,
    {
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let Some(d) = self.next_datagram(wait).await? else {
                return Ok(None);
            };
            if codec::is_ghost(&self.tcb, &d) {
                self.ignore(&d, "ghost");
                continue;
            }
            if !codec::is_valid(&d) {
                log::debug!("[conn:{}] ← corrupted datagram", self.tcb.local_port);
                continue;
            }
            if wanted(&d) {
                return Ok(Some(d));
            }
            if self.already_acknowledged(&d) {
                self.send_ack(&d).await?;
                continue;
            }
            self.ignore(&d, "unexpected");
        }
    }

    fn already_acknowledged(&self, d: &Datagram) -> bool {
        let seen = match d.flag {
            Flag::None => self.last_datagram_received.as_ref(),
            Flag::Fin => self.peer_fin.as_ref(),
            _ => None,
        };
        seen.is_some_and(|s| s.seq_nr == d.seq_nr)
    }

    fn ignore(&self, d: &Datagram, why: &str) {
        log::debug!(
            "[conn:{}] ← {} seq={} ack={} from {:?}:{} ignored ({why})",
            self.tcb.local_port,
            d.flag,
            d.seq_nr,
            d.ack_nr,
            d.src_addr,
            d.src_port
        );
    }
}

impl<C: Channel> Drop for Connection<C> {
    fn drop(&mut self) {
        self.channel.unbind(self.tcb.local_port);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
