//! `datagram-tcp`: a minimal TCP-like connection protocol over an unreliable
//! datagram channel.
//!
//! # Architecture
//!
//! ```text
//!   Application
//!       │  connect / accept / send / receive / close
//!  ┌────▼──────────────────────────────┐
//!  │           Connection              │  state machine, stop-and-wait,
//!  │  (Tcb + ConnectionState + config) │  retries, ghost filtering
//!  └────┬───────────────────────┬──────┘
//!       │ build / vet           │ leases
//!  ┌────▼──────┐          ┌─────▼────────┐
//!  │   codec   │          │ PortAllocator│
//!  └────┬──────┘          └──────────────┘
//!       │ Datagram
//!  ┌────▼──────────────────────────────┐
//!  │         Channel (trait)           │
//!  │  UdpChannel  │  SimNetwork        │
//!  └───────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`datagram`]   wire format (encode / decode / checksum)
//! - [`codec`]      builds outbound datagrams, validates inbound ones
//! - [`state`]      finite-state-machine transition table
//! - [`connection`] per-connection lifecycle
//! - [`ports`]      local port registry
//! - [`config`]     timeouts and retry limits
//! - [`channel`]    the datagram transport abstraction
//! - [`socket`]     UDP transport
//! - [`simulator`]  in-memory lossy transport for testing

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod datagram;
pub mod ports;
pub mod simulator;
pub mod socket;
pub mod state;

pub use channel::{Channel, ChannelError};
pub use config::{ConnectionConfig, HandshakeCheck};
pub use connection::{ConnError, Connection};
pub use datagram::{Datagram, Flag};
pub use ports::PortAllocator;
pub use state::ConnectionState;
