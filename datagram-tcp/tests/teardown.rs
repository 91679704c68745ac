//! Four-step close: active side, passive side, and what happens when the
//! peer stops cooperating.

mod common;

use std::time::Duration;

use tokio::time::Instant;

use datagram_tcp::simulator::Verdict;
use datagram_tcp::{ConnError, ConnectionConfig, ConnectionState, Flag};

use common::{establish, flags, perfect_network, SimConn};

/// Passive side: wait for the FIN, then close.
async fn close_when_peer_does(mut conn: SimConn) -> SimConn {
    let result = conn.receive().await;
    assert!(matches!(result, Err(ConnError::PeerClosed)), "got {result:?}");
    assert_eq!(conn.state(), ConnectionState::CloseWait);
    conn.close().await.expect("passive close");
    conn
}

#[tokio::test(start_paused = true)]
async fn graceful_close_from_the_client() {
    let net = perfect_network();
    let (mut client, server) = establish(&net, ConnectionConfig::default()).await;
    let (client_port, server_port) = (client.local_port(), server.local_port());
    let passive = tokio::spawn(close_when_peer_does(server));

    client.close().await.unwrap();
    let server = passive.await.unwrap();

    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.state(), ConnectionState::Closed);

    let teardown: Vec<_> = net.history().into_iter().skip(3).collect();
    let shape: Vec<_> = teardown.iter().map(|d| (d.flag, d.src_port)).collect();
    assert_eq!(
        shape,
        vec![
            (Flag::Fin, client_port),
            (Flag::Ack, server_port),
            (Flag::Fin, server_port),
            (Flag::Ack, client_port),
        ]
    );
    assert_eq!(teardown[1].ack_nr, teardown[0].seq_nr);
    assert_eq!(teardown[3].ack_nr, teardown[2].seq_nr);
}

#[tokio::test(start_paused = true)]
async fn graceful_close_from_the_server() {
    let net = perfect_network();
    let (client, mut server) = establish(&net, ConnectionConfig::default()).await;
    let passive = tokio::spawn(close_when_peer_does(client));

    server.close().await.unwrap();
    let client = passive.await.unwrap();

    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn passive_close_pauses_before_its_fin() {
    let net = perfect_network();
    let cfg = ConnectionConfig::default().with_close_pause(Duration::from_millis(400));
    let (mut client, server) = establish(&net, cfg).await;
    let passive = tokio::spawn(close_when_peer_does(server));

    let started = Instant::now();
    client.close().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(400));
    passive.await.unwrap();
}

/// Once the peer has closed, every further receive reports it; sending is
/// no longer possible.
#[tokio::test(start_paused = true)]
async fn peer_closed_is_sticky() {
    let net = perfect_network();
    let (mut client, mut server) = establish(&net, ConnectionConfig::default()).await;
    let active = tokio::spawn(async move {
        client.close().await.unwrap();
        client
    });

    assert!(matches!(server.receive().await, Err(ConnError::PeerClosed)));
    assert!(matches!(server.receive().await, Err(ConnError::PeerClosed)));
    assert!(matches!(server.send(b"late").await, Err(ConnError::NotConnected)));
    assert_eq!(server.state(), ConnectionState::CloseWait);

    server.close().await.unwrap();
    assert_eq!(active.await.unwrap().state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn closing_twice_is_unsupported() {
    let net = perfect_network();
    let (mut client, server) = establish(&net, ConnectionConfig::default()).await;
    let passive = tokio::spawn(close_when_peer_does(server));

    client.close().await.unwrap();
    let again = client.close().await;
    assert!(matches!(again, Err(ConnError::Unsupported(ConnectionState::Closed))));
    passive.await.unwrap();
}

/// When the ACK of our FIN is lost, the peer's FIN stands in for it.
#[tokio::test(start_paused = true)]
async fn peer_fin_stands_in_for_a_lost_ack() {
    let net = perfect_network();
    let (mut client, server) = establish(&net, ConnectionConfig::default()).await;
    let server_port = server.local_port();
    let mut dropped = false;
    net.set_script(move |d| {
        if d.flag == Flag::Ack && d.src_port == server_port && !dropped {
            dropped = true;
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    });
    let passive = tokio::spawn(close_when_peer_does(server));

    client.close().await.unwrap();
    let server = passive.await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.state(), ConnectionState::Closed);
    // The client never resent its FIN.
    assert_eq!(flags(&net).iter().filter(|f| **f == Flag::Fin).count(), 2);
}

/// A lost FIN is resent after a timeout.
#[tokio::test(start_paused = true)]
async fn lost_fin_is_retransmitted() {
    let net = perfect_network();
    let (mut client, server) = establish(&net, ConnectionConfig::default()).await;
    let client_port = client.local_port();
    let mut dropped = false;
    net.set_script(move |d| {
        if d.flag == Flag::Fin && d.src_port == client_port && !dropped {
            dropped = true;
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    });
    let passive = tokio::spawn(close_when_peer_does(server));

    client.close().await.unwrap();
    let server = passive.await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.state(), ConnectionState::Closed);

    let client_fins: Vec<_> = net
        .history()
        .into_iter()
        .filter(|d| d.flag == Flag::Fin && d.src_port == client_port)
        .collect();
    assert_eq!(client_fins.len(), 2);
    assert_eq!(client_fins[0].seq_nr, client_fins[1].seq_nr);
}

/// An unresponsive peer cannot keep the active side open forever.
#[tokio::test(start_paused = true)]
async fn active_close_gives_up_on_a_silent_peer() {
    let net = perfect_network();
    let cfg = ConnectionConfig::default().with_max_retries(2);
    let (mut client, _server) = establish(&net, cfg).await;

    let started = Instant::now();
    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(flags(&net).iter().filter(|f| **f == Flag::Fin).count(), 3);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

/// The peer acknowledges our FIN but never sends its own.
#[tokio::test(start_paused = true)]
async fn fin_wait_2_gives_up_without_peer_fin() {
    let net = perfect_network();
    let (mut client, server) = establish(&net, ConnectionConfig::default()).await;
    let server_port = server.local_port();
    net.set_script(move |d| {
        if d.flag == Flag::Fin && d.src_port == server_port {
            Verdict::Drop
        } else {
            Verdict::Deliver
        }
    });
    let passive = tokio::spawn(close_when_peer_does(server));

    client.close().await.unwrap();
    let server = passive.await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    // The passive side waits once for its ACK and closes regardless.
    assert_eq!(server.state(), ConnectionState::Closed);
}
