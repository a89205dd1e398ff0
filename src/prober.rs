//! Periodic ICMP echo probing of a gateway.
//!
//! A running prober owns two threads: one sends a request every interval, the
//! other waits for replies. Both report what happened as [`ProbeEvent`]s on a
//! channel and never touch shared state themselves.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::icmp::{Echo, IcmpSocket};

/// How long a receive call blocks before the stop signal is checked again
const RECV_POLL: Duration = Duration::from_millis(200);

/// Something that happened on the wire, stamped when it happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    Sent { seq: u16, at: Instant },
    Received { seq: u16, at: Instant },
}

/// What to probe and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProberConfig {
    pub target: IpAddr,
    pub source: IpAddr,
    pub interface: Option<String>,
    pub interval: Duration,
}

/// The sending half of an echo socket
trait EchoSender {
    fn send_echo(&self, target: IpAddr, echo: Echo) -> std::io::Result<()>;
}

impl EchoSender for IcmpSocket {
    fn send_echo(&self, target: IpAddr, echo: Echo) -> std::io::Result<()> {
        IcmpSocket::send_echo(self, target, echo)
    }
}

/// A running prober
pub trait ProbeHandle: Send {
    /// Stop probing and wait until no further events can be emitted
    fn stop(self: Box<Self>);
}

/// Starts probers; the seam between route monitoring and the network
pub trait Pinger: Send + Sync {
    fn start(
        &self,
        config: ProberConfig,
        events: Sender<ProbeEvent>,
    ) -> std::io::Result<Box<dyn ProbeHandle>>;
}

/// Prober backed by ICMP echo sockets
#[derive(Debug, Clone)]
pub struct IcmpPinger {
    privileged: bool,
    next_ident: Arc<AtomicU16>,
}

impl IcmpPinger {
    pub fn new(privileged: bool) -> Self {
        IcmpPinger {
            privileged,
            next_ident: Arc::new(AtomicU16::new(std::process::id() as u16)),
        }
    }
}

impl Pinger for IcmpPinger {
    fn start(
        &self,
        config: ProberConfig,
        events: Sender<ProbeEvent>,
    ) -> std::io::Result<Box<dyn ProbeHandle>> {
        let socket = Arc::new(IcmpSocket::open(
            config.source,
            config.interface.as_deref(),
            self.privileged,
            RECV_POLL,
        )?);
        // Raw sockets see every echo reply on the host; a per-socket ident
        // tells ours apart.
        let ident = self.next_ident.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let label = config
            .interface
            .clone()
            .unwrap_or_else(|| config.target.to_string());

        let sender = {
            let socket = Arc::clone(&socket);
            let events = events.clone();
            let stop_rx = stop_rx.clone();
            let config = config.clone();
            thread::Builder::new()
                .name(format!("ping-tx-{}", label))
                .spawn(move || send_loop(&*socket, &config, ident, &events, &stop_rx))?
        };

        let target = config.target;
        let receiver = thread::Builder::new()
            .name(format!("ping-rx-{}", label))
            .spawn(move || receive_loop(&socket, target, ident, &events, &stop_rx));
        let receiver = match receiver {
            Ok(handle) => handle,
            Err(e) => {
                drop(stop_tx);
                let _ = sender.join();
                return Err(e);
            }
        };

        debug!(
            "Started pinging {} from {} (ident {})",
            config.target, config.source, ident
        );
        Ok(Box::new(IcmpProbeHandle {
            stop_tx: Some(stop_tx),
            threads: vec![sender, receiver],
        }))
    }
}

struct IcmpProbeHandle {
    stop_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl ProbeHandle for IcmpProbeHandle {
    fn stop(mut self: Box<Self>) {
        // Dropping the sender disconnects every stop receiver
        self.stop_tx.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Prober thread panicked");
            }
        }
    }
}

fn send_loop(
    socket: &impl EchoSender,
    config: &ProberConfig,
    ident: u16,
    events: &Sender<ProbeEvent>,
    stop: &Receiver<()>,
) {
    let mut seq: u16 = 0;
    loop {
        let at = Instant::now();
        // A request that never left is still outstanding; a lost source
        // address or path must count as down time.
        if let Err(e) = socket.send_echo(config.target, Echo { ident, seq }) {
            debug!("Failed to send echo request to {}: {}", config.target, e);
        }
        if events.send(ProbeEvent::Sent { seq, at }).is_err() {
            return;
        }
        seq = seq.wrapping_add(1);

        match stop.recv_timeout(config.interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => return,
        }
    }
}

fn receive_loop(
    socket: &IcmpSocket,
    target: IpAddr,
    ident: u16,
    events: &Sender<ProbeEvent>,
    stop: &Receiver<()>,
) {
    loop {
        if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
            return;
        }
        match socket.recv_echo_reply() {
            Ok(Some((from, echo))) => {
                if from != target || (socket.filters_ident() && echo.ident != ident) {
                    continue;
                }
                let event = ProbeEvent::Received {
                    seq: echo.seq,
                    at: Instant::now(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to receive echo reply from {}: {}", target, e);
                if let Err(RecvTimeoutError::Disconnected) = stop.recv_timeout(RECV_POLL) {
                    return;
                }
            }
        }
    }
}
