//! Entry point for `datagram-tcp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, argument parsing) and a small echo application.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use datagram_tcp::config::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};
use datagram_tcp::socket::UdpChannel;
use datagram_tcp::{ConnError, Connection, ConnectionConfig, HandshakeCheck, PortAllocator};

/// TCP-like connections over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct Tuning {
    /// How long each receive waits, in milliseconds.
    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Retransmissions allowed per send / receive / close.
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Reject corrupted or misaddressed SYN / SYN_ACK datagrams.
    #[arg(long, global = true)]
    strict_handshake: bool,
}

impl Tuning {
    fn config(&self) -> ConnectionConfig {
        let check = if self.strict_handshake {
            HandshakeCheck::Strict
        } else {
            HandshakeCheck::Lenient
        };
        ConnectionConfig::default()
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_retries(self.max_retries)
            .with_handshake_check(check)
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and echo every message back.
    Server {
        /// Local address to bind.
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: IpAddr,
        /// Address peers should see as our source; required with a wildcard bind.
        #[arg(long)]
        advertise: Option<IpAddr>,
        /// Listening port.
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
    },
    /// Connect, send each message, print the echoes, then close.
    Client {
        /// Server address.
        #[arg(short, long, default_value = "127.0.0.1")]
        server: IpAddr,
        /// Server listening port.
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
        /// Local address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        bind: IpAddr,
        /// Messages to send.
        #[arg(required = true)]
        messages: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.tuning.config();
    let ports = Arc::new(PortAllocator::default());

    match cli.mode {
        Mode::Server {
            bind,
            advertise,
            port,
        } => {
            if bind.is_unspecified() && advertise.is_none() {
                anyhow::bail!("--advertise is required when binding {bind}");
            }
            let channel = Arc::new(UdpChannel::new(bind).with_public_addr(advertise.unwrap_or(bind)));
            channel
                .bind(port)
                .with_context(|| format!("binding {bind}:{port}"))?;
            run_server(channel, ports, port, config).await
        }
        Mode::Client {
            server,
            port,
            bind,
            messages,
        } => {
            let channel = Arc::new(UdpChannel::new(bind));
            run_client(channel, ports, server, port, config, &messages).await
        }
    }
}

async fn run_server(
    channel: Arc<UdpChannel>,
    ports: Arc<PortAllocator>,
    port: u16,
    config: ConnectionConfig,
) -> Result<()> {
    let mut listener = Connection::listen(channel, ports, port, config)?;
    log::info!("Starting server on port {port}");

    loop {
        let conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(e @ ConnError::Listener(_)) => return Err(e).context("accept failed"),
            Err(e) => {
                log::warn!("could not accept peer, still listening: {e}");
                continue;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = echo(conn).await {
                log::warn!("session ended with error: {e}");
            }
        });
    }
}

async fn echo(mut conn: Connection<UdpChannel>) -> Result<(), ConnError> {
    let peer = (conn.remote_addr(), conn.remote_port());
    loop {
        match conn.receive().await {
            Ok(message) => {
                log::info!("{peer:?}: {}", String::from_utf8_lossy(&message));
                conn.send(&message).await?;
            }
            Err(ConnError::PeerClosed) => break,
            Err(e) => return Err(e),
        }
    }
    conn.close().await?;
    log::info!("{peer:?}: closed");
    Ok(())
}

async fn run_client(
    channel: Arc<UdpChannel>,
    ports: Arc<PortAllocator>,
    server: IpAddr,
    port: u16,
    config: ConnectionConfig,
    messages: &[String],
) -> Result<()> {
    let mut conn = Connection::open(channel, ports, config)?;
    log::info!("Starting client, connecting to {server}:{port}");
    conn.connect(server, port)
        .await
        .with_context(|| format!("connecting to {server}:{port}"))?;

    for message in messages {
        conn.send(message.as_bytes()).await.context("send failed")?;
        let reply = conn.receive().await.context("no echo")?;
        println!("{}", String::from_utf8_lossy(&reply));
    }

    conn.close().await.context("close failed")?;
    Ok(())
}
