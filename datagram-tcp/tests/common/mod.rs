//! Shared fixtures for the integration tests.
//!
//! Every test runs over an in-memory [`SimNetwork`] on paused tokio time, so
//! the default one-second timeouts cost nothing.

#![allow(dead_code)]

use std::sync::Arc;

use datagram_tcp::codec::Tcb;
use datagram_tcp::simulator::{SimNetwork, SimulatorConfig};
use datagram_tcp::{Channel, Connection, ConnectionConfig, Datagram, Flag, PortAllocator};

pub const LISTEN_PORT: u16 = 9000;

pub type SimConn = Connection<SimNetwork>;

pub fn perfect_network() -> Arc<SimNetwork> {
    Arc::new(SimNetwork::new(SimulatorConfig::default()))
}

/// Run a full handshake and return `(client, server)`, both ESTABLISHED.
pub async fn establish(net: &Arc<SimNetwork>, config: ConnectionConfig) -> (SimConn, SimConn) {
    let ports = Arc::new(PortAllocator::default());
    let mut listener = Connection::listen(Arc::clone(net), Arc::clone(&ports), LISTEN_PORT, config)
        .expect("listen");
    let accepting = tokio::spawn(async move { listener.accept().await });

    let mut client = Connection::open(Arc::clone(net), ports, config).expect("open");
    client
        .connect(net.local_addr(), LISTEN_PORT)
        .await
        .expect("connect");
    let server = accepting.await.expect("accept task").expect("accept");
    (client, server)
}

/// A control block impersonating `conn`'s peer, for forging datagrams that
/// `conn` will take as genuine.
pub fn peer_of(conn: &SimConn) -> Tcb {
    let mut tcb = Tcb::new(
        conn.remote_addr().expect("connected"),
        conn.remote_port(),
        0,
    );
    tcb.remote_addr = Some(conn.local_addr());
    tcb.remote_port = conn.local_port();
    tcb
}

/// Data datagrams sent from `port`, in order.
pub fn data_from(net: &SimNetwork, port: u16) -> Vec<Datagram> {
    net.history()
        .into_iter()
        .filter(|d| d.src_port == port && d.flag == Flag::None)
        .collect()
}

/// Flags of every datagram sent, in order.
pub fn flags(net: &SimNetwork) -> Vec<Flag> {
    net.history().iter().map(|d| d.flag).collect()
}
