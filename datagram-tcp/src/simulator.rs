//! In-memory network for deterministic testing.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To exercise
//! the reliability mechanisms without depending on actual network conditions,
//! [`SimNetwork`] implements [`Channel`] entirely in memory: one mailbox per
//! port on a single simulated host, with a configurable fault model applied
//! on every send:
//!
//! | Fault        | Description                                          |
//! |--------------|------------------------------------------------------|
//! | Loss         | Drop a datagram with probability `loss_rate`.        |
//! | Corruption   | Flip one bit, leaving the stored checksum stale.     |
//! | Duplication  | Deliver a datagram twice.                            |
//! | Reordering   | Delay a datagram by `reorder_delay`, letting later   |
//! |              | datagrams overtake it.                               |
//!
//! Faults are drawn from a `StdRng` seeded from the config, so a failing run
//! replays exactly.  Tests that need a specific datagram to misbehave install
//! a script instead ([`SimNetwork::set_script`]) which picks a [`Verdict`]
//! per datagram and bypasses the random model.
//!
//! Delays run on tokio time, so under `#[tokio::test(start_paused = true)]`
//! the whole network advances on virtual time.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::channel::{self, Channel, ChannelError};
use crate::datagram::Datagram;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a datagram has one bit flipped.
    pub corrupt_rate: f64,
    /// Probability that a datagram is held back.
    pub reorder_rate: f64,
    /// Fixed delay applied to held-back datagrams.
    pub reorder_delay: Duration,
    /// Seed for the fault RNG.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a perfect network.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::from_millis(50),
            seed: 0,
        }
    }
}

/// What happens to one datagram in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    Drop,
    Corrupt,
    Duplicate,
    Delay(Duration),
}

/// Counters over every datagram handed to [`Channel::send`].
///
/// Delayed datagrams are counted under `delayed`, not `delivered`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub delayed: u64,
}

type Script = Box<dyn FnMut(&Datagram) -> Verdict + Send>;

struct Mailbox {
    tx: UnboundedSender<Datagram>,
    rx: Arc<tokio::sync::Mutex<UnboundedReceiver<Datagram>>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

struct Inner {
    config: SimulatorConfig,
    rng: StdRng,
    script: Option<Script>,
    mailboxes: HashMap<u16, Mailbox>,
    stats: NetStats,
    history: Vec<Datagram>,
}

impl Inner {
    fn mailbox(&mut self, port: u16) -> &Mailbox {
        self.mailboxes.entry(port).or_insert_with(Mailbox::new)
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }

    fn verdict(&mut self, datagram: &Datagram) -> Verdict {
        if let Some(script) = self.script.as_mut() {
            return script(datagram);
        }
        let cfg = self.config.clone();
        if self.roll(cfg.loss_rate) {
            Verdict::Drop
        } else if self.roll(cfg.corrupt_rate) {
            Verdict::Corrupt
        } else if self.roll(cfg.duplicate_rate) {
            Verdict::Duplicate
        } else if self.roll(cfg.reorder_rate) {
            Verdict::Delay(cfg.reorder_delay)
        } else {
            Verdict::Deliver
        }
    }

    /// Flip a single bit of the payload, or of the sequence number when there
    /// is no payload.  The checksum is left as it was.
    fn corrupt(&mut self, datagram: &mut Datagram) {
        match datagram.payload.as_mut().filter(|p| !p.is_empty()) {
            Some(payload) => {
                let i = self.rng.gen_range(0..payload.len());
                payload[i] ^= 1 << self.rng.gen_range(0..8);
            }
            None => datagram.seq_nr ^= 1 << self.rng.gen_range(0..32),
        }
    }
}

/// A single simulated host whose ports exchange datagrams in memory.
pub struct SimNetwork {
    addr: IpAddr,
    inner: Mutex<Inner>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl SimNetwork {
    /// Network on 127.0.0.1 using the given fault model.
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            inner: Mutex::new(Inner {
                rng: StdRng::seed_from_u64(config.seed),
                config,
                script: None,
                mailboxes: HashMap::new(),
                stats: NetStats::default(),
                history: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the fault model.  The RNG keeps its state.
    pub fn set_config(&self, config: SimulatorConfig) {
        self.lock().config = config;
    }

    pub fn set_loss_rate(&self, loss_rate: f64) {
        self.lock().config.loss_rate = loss_rate;
    }

    /// Decide the fate of every subsequent datagram with `script`.
    pub fn set_script<F>(&self, script: F)
    where
        F: FnMut(&Datagram) -> Verdict + Send + 'static,
    {
        self.lock().script = Some(Box::new(script));
    }

    /// Return to the random fault model.
    pub fn clear_script(&self) {
        self.lock().script = None;
    }

    /// Place `datagram` straight into the mailbox of its destination port,
    /// bypassing faults, counters and history.
    pub fn inject(&self, datagram: Datagram) {
        let mut inner = self.lock();
        let port = datagram.dest_port;
        // The mailbox owns its receiver, so this cannot fail.
        let _ = inner.mailbox(port).tx.send(datagram);
    }

    pub fn stats(&self) -> NetStats {
        self.lock().stats
    }

    /// Every datagram handed to `send`, in order, as sent.
    pub fn history(&self) -> Vec<Datagram> {
        self.lock().history.clone()
    }
}

impl Channel for SimNetwork {
    fn local_addr(&self) -> IpAddr {
        self.addr
    }

    async fn send(&self, datagram: &Datagram) -> Result<(), ChannelError> {
        let dest = datagram.dest_addr.ok_or(ChannelError::NoDestination)?;
        channel::ensure_fits(datagram)?;

        let delayed = {
            let mut inner = self.lock();
            inner.stats.sent += 1;
            inner.history.push(datagram.clone());

            if dest != self.addr {
                log::trace!("[sim] no route to {dest}, dropping {}", datagram.flag);
                inner.stats.dropped += 1;
                return Ok(());
            }

            let verdict = inner.verdict(datagram);
            log::trace!(
                "[sim] {} seq={} → :{} {verdict:?}",
                datagram.flag,
                datagram.seq_nr,
                datagram.dest_port
            );
            let tx = inner.mailbox(datagram.dest_port).tx.clone();
            match verdict {
                Verdict::Deliver => {
                    let _ = tx.send(datagram.clone());
                    inner.stats.delivered += 1;
                    None
                }
                Verdict::Drop => {
                    inner.stats.dropped += 1;
                    None
                }
                Verdict::Corrupt => {
                    let mut damaged = datagram.clone();
                    inner.corrupt(&mut damaged);
                    let _ = tx.send(damaged);
                    inner.stats.corrupted += 1;
                    inner.stats.delivered += 1;
                    None
                }
                Verdict::Duplicate => {
                    let _ = tx.send(datagram.clone());
                    let _ = tx.send(datagram.clone());
                    inner.stats.duplicated += 1;
                    inner.stats.delivered += 2;
                    None
                }
                Verdict::Delay(after) => {
                    inner.stats.delayed += 1;
                    Some((tx, after))
                }
            }
        };

        if let Some((tx, after)) = delayed {
            let datagram = datagram.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = tx.send(datagram);
            });
        }
        Ok(())
    }

    async fn receive(&self, port: u16, timeout: Duration) -> Result<Option<Datagram>, ChannelError> {
        let rx = {
            let mut inner = self.lock();
            Arc::clone(&inner.mailbox(port).rx)
        };
        let mut rx = rx.lock().await;
        Ok(tokio::time::timeout(timeout, rx.recv()).await.ok().flatten())
    }

    /// Drops the port's mailbox along with anything still queued in it.
    fn unbind(&self, port: u16) {
        self.lock().mailboxes.remove(&port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Tcb};

    const WAIT: Duration = Duration::from_millis(100);

    fn to_port(net: &SimNetwork, from: u16, to: u16, payload: &[u8]) -> Datagram {
        let mut tcb = Tcb::new(net.local_addr(), from, 0);
        tcb.remote_addr = Some(net.local_addr());
        tcb.remote_port = to;
        codec::build_data(&mut tcb, payload.to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn perfect_network_delivers_in_order() {
        let net = SimNetwork::default();
        for i in 0..3u8 {
            net.send(&to_port(&net, 1, 2, &[i])).await.unwrap();
        }
        for i in 0..3u8 {
            let d = net.receive(2, WAIT).await.unwrap().unwrap();
            assert_eq!(d.payload_bytes(), &[i]);
        }
        assert!(net.receive(2, WAIT).await.unwrap().is_none());
        assert_eq!(net.stats().delivered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn total_loss_delivers_nothing() {
        let net = SimNetwork::new(SimulatorConfig {
            loss_rate: 1.0,
            ..Default::default()
        });
        net.send(&to_port(&net, 1, 2, b"x")).await.unwrap();
        assert!(net.receive(2, WAIT).await.unwrap().is_none());
        assert_eq!(net.stats().dropped, 1);
        assert_eq!(net.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn corruption_breaks_the_checksum() {
        let net = SimNetwork::new(SimulatorConfig {
            corrupt_rate: 1.0,
            ..Default::default()
        });
        let sent = to_port(&net, 1, 2, b"payload");
        net.send(&sent).await.unwrap();
        let got = net.receive(2, WAIT).await.unwrap().unwrap();
        assert_ne!(got, sent);
        assert!(!codec::is_valid(&got));
    }

    #[tokio::test(start_paused = true)]
    async fn duplication_delivers_twice() {
        let net = SimNetwork::new(SimulatorConfig {
            duplicate_rate: 1.0,
            ..Default::default()
        });
        let sent = to_port(&net, 1, 2, b"twice");
        net.send(&sent).await.unwrap();
        assert_eq!(net.receive(2, WAIT).await.unwrap(), Some(sent.clone()));
        assert_eq!(net.receive(2, WAIT).await.unwrap(), Some(sent));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_datagram_is_overtaken() {
        let net = SimNetwork::default();
        let mut first = true;
        net.set_script(move |_| {
            if std::mem::take(&mut first) {
                Verdict::Delay(Duration::from_millis(30))
            } else {
                Verdict::Deliver
            }
        });
        net.send(&to_port(&net, 1, 2, b"a")).await.unwrap();
        net.send(&to_port(&net, 1, 2, b"b")).await.unwrap();
        assert_eq!(net.receive(2, WAIT).await.unwrap().unwrap().payload_bytes(), b"b");
        assert_eq!(net.receive(2, WAIT).await.unwrap().unwrap().payload_bytes(), b"a");
    }

    #[tokio::test(start_paused = true)]
    async fn same_seed_same_faults() {
        let cfg = SimulatorConfig {
            loss_rate: 0.5,
            seed: 42,
            ..Default::default()
        };
        let run = |net: SimNetwork| async move {
            for _ in 0..32 {
                net.send(&to_port(&net, 1, 2, b"r")).await.unwrap();
            }
            net.stats()
        };
        let a = run(SimNetwork::new(cfg.clone())).await;
        let b = run(SimNetwork::new(cfg)).await;
        assert_eq!(a, b);
        assert!(a.dropped > 0 && a.delivered > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_payload_is_refused() {
        let net = SimNetwork::default();
        let big = to_port(&net, 1, 2, &vec![0; crate::datagram::MAX_PAYLOAD + 1]);
        assert!(matches!(net.send(&big).await, Err(ChannelError::Oversized(_))));
        assert!(net.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_destination_is_unroutable() {
        let net = SimNetwork::default();
        let mut d = to_port(&net, 1, 2, b"x");
        d.dest_addr = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        net.send(&d).await.unwrap();
        assert!(net.receive(2, WAIT).await.unwrap().is_none());
        assert_eq!(net.stats().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inject_bypasses_the_fault_model() {
        let net = SimNetwork::new(SimulatorConfig {
            loss_rate: 1.0,
            ..Default::default()
        });
        net.inject(to_port(&net, 1, 2, b"ghost"));
        assert!(net.receive(2, WAIT).await.unwrap().is_some());
        assert_eq!(net.stats(), NetStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn unbind_discards_queued_datagrams() {
        let net = SimNetwork::default();
        net.send(&to_port(&net, 1, 2, b"stale")).await.unwrap();
        net.unbind(2);
        assert!(net.receive(2, WAIT).await.unwrap().is_none());
    }
}
