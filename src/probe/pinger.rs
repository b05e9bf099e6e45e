//! Native ICMP pinger.
//!
//! Sends one echo request per interval from an async loop and receives
//! replies on a dedicated OS thread. Every send, reply, duplicate reply and
//! loss is reported to the attached [`PacketHandler`].

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::sync::{oneshot, watch};

use super::icmp::{self, Family, Message};
use super::{LossReason, Packet, PacketHandler, Probe, ProbeError, ProbeState, StateCell};

/// Smallest accepted payload: room for the send timestamp and the tracker.
pub const MIN_SIZE: usize = icmp::STAMP_LEN;

/// Largest accepted payload.
pub const MAX_SIZE: usize = 65_000;

/// How often the receiver thread wakes up to check for shutdown.
const RECV_POLL: Duration = Duration::from_millis(100);

/// Which address family a pinger may resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Any,
    V4,
    V6,
}

impl Network {
    fn accepts(&self, ip: IpAddr) -> bool {
        match self {
            Network::Any => true,
            Network::V4 => ip.is_ipv4(),
            Network::V6 => ip.is_ipv6(),
        }
    }
}

impl FromStr for Network {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "ip" => Ok(Network::Any),
            "ip4" => Ok(Network::V4),
            "ip6" => Ok(Network::V6),
            other => Err(ProbeError::Config(format!("unknown network: {}", other))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Any => "ip",
            Network::V4 => "ip4",
            Network::V6 => "ip6",
        })
    }
}

/// Settings for a single pinger.
#[derive(Debug, Clone)]
pub struct PingerOptions {
    pub address: String,
    pub size: usize,
    pub network: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Prefer a raw socket. Falls back to a datagram ICMP socket when raw
    /// sockets are not permitted.
    pub privileged: bool,
}

impl PingerOptions {
    fn validate(&self) -> Result<Network, ProbeError> {
        if !(MIN_SIZE..=MAX_SIZE).contains(&self.size) {
            return Err(ProbeError::Config(format!(
                "size {} outside {}..={}",
                self.size, MIN_SIZE, MAX_SIZE
            )));
        }
        if self.interval.is_zero() {
            return Err(ProbeError::Config("interval must be positive".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(ProbeError::Config("timeout must be positive".to_string()));
        }
        self.network.parse()
    }
}

/// An ICMP echo prober bound to one resolved address.
pub struct Pinger {
    target: String,
    ip: IpAddr,
    size: usize,
    interval: Duration,
    timeout: Duration,
    privileged: bool,
    identifier: u16,
    /// Carried in every payload; replies without it belong to someone else.
    tracker: u64,
    state: StateCell,
    stop_tx: watch::Sender<bool>,
    handler: OnceLock<Arc<dyn PacketHandler>>,
}

impl fmt::Debug for Pinger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pinger")
            .field("target", &self.target)
            .field("ip", &self.ip)
            .field("size", &self.size)
            .field("interval", &self.interval)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Pinger {
    /// Validate the options and resolve the address.
    ///
    /// No socket is opened until [`Probe::run`] is called.
    pub async fn new(options: PingerOptions) -> Result<Self, ProbeError> {
        let network = options.validate()?;
        let ip = resolve_address(&options.address, network).await?;
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            target: options.address,
            ip,
            size: options.size,
            interval: options.interval,
            timeout: options.timeout,
            privileged: options.privileged,
            identifier: rand::random(),
            tracker: rand::random(),
            state: StateCell::default(),
            stop_tx,
            handler: OnceLock::new(),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Install the event handler. Returns false if one was already attached.
    pub fn attach(&self, handler: Arc<dyn PacketHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    fn family(&self) -> Family {
        match self.ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Open the ICMP socket, returning it with whether it is raw.
    fn open_socket(&self) -> Result<(Socket, bool), ProbeError> {
        let (domain, protocol) = match self.family() {
            Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
            Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };

        let raw = if self.privileged {
            match Socket::new(domain, Type::RAW, Some(protocol)) {
                Ok(socket) => Some(socket),
                Err(e) => {
                    tracing::warn!(
                        "Pinger {}: raw ICMP socket unavailable ({}), using datagram socket",
                        self.target,
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let (socket, is_raw) = match raw {
            Some(socket) => (socket, true),
            None => {
                let socket = Socket::new(domain, Type::DGRAM, Some(protocol)).map_err(|e| {
                    ProbeError::Network(format!("failed to create ICMP socket: {}", e))
                })?;
                (socket, false)
            }
        };

        socket
            .set_read_timeout(Some(RECV_POLL))
            .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
        socket
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

        Ok((socket, is_raw))
    }

    async fn run_loop(&self) -> Result<(), ProbeError> {
        let (socket, is_raw) = self.open_socket()?;
        let socket = Arc::new(socket);
        let family = self.family();

        let dispatcher = Arc::new(Dispatcher {
            target: self.target.clone(),
            ip: self.ip,
            identifier: self.identifier,
            tracker: self.tracker,
            // Datagram sockets get their identifier rewritten by the kernel,
            // which also filters replies per socket.
            match_identifier: is_raw,
            inflight: Mutex::new(InFlight::default()),
            handler: self.handler.get().cloned(),
        });

        let done = Arc::new(AtomicBool::new(false));
        let mut receiver = spawn_receiver(socket.clone(), family, dispatcher.clone(), done.clone())?;

        let dest = SocketAddr::new(self.ip, 0);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut seq: u16 = 0;

        let outcome = loop {
            tokio::select! {
                _ = super::stop_requested(&mut stop_rx) => break Ok(()),
                received = &mut receiver => return flatten_receiver(received),
                _ = interval.tick() => {
                    dispatcher.expire(self.timeout, Instant::now());

                    let packet = icmp::build_echo_request(
                        family,
                        self.identifier,
                        seq,
                        self.tracker,
                        self.size,
                    );
                    dispatcher.sent(seq, packet.len(), Instant::now());
                    match send_echo(socket.clone(), packet, dest).await {
                        Ok(()) => {}
                        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                            tracing::warn!("Pinger {}: send buffer full, seq {} dropped", self.target, seq);
                        }
                        Err(e) => {
                            break Err(ProbeError::Network(format!(
                                "failed to send to {}: {}",
                                self.ip, e
                            )));
                        }
                    }
                    seq = seq.wrapping_add(1);
                }
            }
        };

        // The receiver checks `done` once per poll period.
        done.store(true, Ordering::Release);
        let deadline = RECV_POLL * 10;
        let stopped = match tokio::time::timeout(deadline, receiver).await {
            Ok(received) => flatten_receiver(received),
            Err(_) => {
                tracing::warn!("Pinger {}: receiver did not stop within {:?}", self.target, deadline);
                Err(ProbeError::Timeout(deadline))
            }
        };
        outcome.and(stopped)
    }
}

#[async_trait]
impl Probe for Pinger {
    fn name(&self) -> &str {
        &self.target
    }

    async fn run(&self) -> Result<(), ProbeError> {
        if !self.state.transition(ProbeState::Created, ProbeState::Running) {
            return Err(ProbeError::AlreadyStarted);
        }
        tracing::debug!("Pinger {} ({}): started", self.target, self.ip);

        let result = self.run_loop().await;

        self.state.set(ProbeState::Stopped);
        tracing::debug!("Pinger {} ({}): stopped", self.target, self.ip);
        result
    }

    fn stop(&self) {
        match self.state.get() {
            ProbeState::Running | ProbeState::Stopping => {
                self.state.transition(ProbeState::Running, ProbeState::Stopping);
                self.stop_tx.send_replace(true);
            }
            ProbeState::Created | ProbeState::Stopped => {}
        }
    }

    fn state(&self) -> ProbeState {
        self.state.get()
    }
}

fn flatten_receiver(
    received: Result<Result<(), ProbeError>, oneshot::error::RecvError>,
) -> Result<(), ProbeError> {
    received.unwrap_or_else(|_| {
        Err(ProbeError::Network(
            "receiver thread exited without a result".to_string(),
        ))
    })
}

/// Send one request from the blocking pool.
///
/// The socket is blocking so the receiver thread can wait on it; each send
/// is bounded by the socket's write timeout.
async fn send_echo(socket: Arc<Socket>, packet: Vec<u8>, dest: SocketAddr) -> io::Result<()> {
    tokio::task::spawn_blocking(move || socket.send_to(&packet, &SockAddr::from(dest)).map(|_| ()))
        .await
        .map_err(io::Error::other)?
}

/// Run [`receive_loop`] on its own OS thread.
///
/// Receivers live as long as their pinger, so they stay out of the runtime's
/// blocking pool, which is capped and meant for short calls.
fn spawn_receiver(
    socket: Arc<Socket>,
    family: Family,
    dispatcher: Arc<Dispatcher>,
    done: Arc<AtomicBool>,
) -> Result<oneshot::Receiver<Result<(), ProbeError>>, ProbeError> {
    let (result_tx, result_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("ping-recv".to_string())
        .spawn(move || {
            let _ = result_tx.send(receive_loop(&socket, family, &dispatcher, &done));
        })
        .map_err(|e| ProbeError::Network(format!("failed to start receiver thread: {}", e)))?;
    Ok(result_rx)
}

/// Resolve an address, honouring the requested network family.
async fn resolve_address(address: &str, network: Network) -> Result<IpAddr, ProbeError> {
    let resolve_err = |reason: String| ProbeError::Resolve {
        address: address.to_string(),
        reason,
    };

    if let Ok(ip) = address.parse::<IpAddr>() {
        if network.accepts(ip) {
            return Ok(ip);
        }
        return Err(resolve_err(format!("not an {} address", network)));
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| resolve_err(e.to_string()))?;

    addrs
        .find(|sa| network.accepts(sa.ip()))
        .map(|sa| sa.ip())
        .ok_or_else(|| resolve_err(format!("no {} addresses found", network)))
}

/// Blocking receive loop; runs until `done` is set or the socket fails.
fn receive_loop(
    socket: &Socket,
    family: Family,
    dispatcher: &Dispatcher,
    done: &AtomicBool,
) -> Result<(), ProbeError> {
    let mut buf = [MaybeUninit::<u8>::uninit(); 2048];

    while !done.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(ProbeError::Network(format!("failed to receive: {}", e))),
        };
        // SAFETY: recv_from initialized the first `len` bytes.
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let (Some(message), Some(from)) = (icmp::parse(family, data), from.as_socket()) else {
            continue;
        };
        dispatcher.handle(message, from.ip(), len, Instant::now());
    }

    Ok(())
}

/// Outcome of matching a reply against outstanding requests.
#[derive(Debug, PartialEq)]
enum Matched {
    First(Duration),
    Duplicate(Duration),
    Unknown,
}

#[derive(Debug)]
struct Sent {
    at: Instant,
    answered: bool,
}

/// Requests sent within the last timeout window.
#[derive(Debug, Default)]
struct InFlight {
    sent: HashMap<u16, Sent>,
}

impl InFlight {
    fn insert(&mut self, seq: u16, at: Instant) {
        self.sent.insert(seq, Sent { at, answered: false });
    }

    fn reply(&mut self, seq: u16, now: Instant) -> Matched {
        match self.sent.get_mut(&seq) {
            Some(sent) if sent.answered => Matched::Duplicate(now.saturating_duration_since(sent.at)),
            Some(sent) => {
                sent.answered = true;
                Matched::First(now.saturating_duration_since(sent.at))
            }
            None => Matched::Unknown,
        }
    }

    /// Forget an unanswered request reported unreachable.
    fn unreachable(&mut self, seq: u16, now: Instant) -> Option<Duration> {
        match self.sent.get(&seq) {
            Some(sent) if !sent.answered => {
                let elapsed = now.saturating_duration_since(sent.at);
                self.sent.remove(&seq);
                Some(elapsed)
            }
            _ => None,
        }
    }

    /// Drop entries older than `timeout`, returning the unanswered ones.
    fn expire(&mut self, timeout: Duration, now: Instant) -> Vec<u16> {
        let mut lost = Vec::new();
        self.sent.retain(|seq, sent| {
            if now.saturating_duration_since(sent.at) < timeout {
                return true;
            }
            if !sent.answered {
                lost.push(*seq);
            }
            false
        });
        lost.sort_unstable();
        lost
    }
}

/// Turns socket activity into [`Packet`] events for one pinger.
struct Dispatcher {
    target: String,
    ip: IpAddr,
    identifier: u16,
    tracker: u64,
    match_identifier: bool,
    inflight: Mutex<InFlight>,
    handler: Option<Arc<dyn PacketHandler>>,
}

impl Dispatcher {
    fn packet(&self, addr: String, seq: u16, nbytes: usize, rtt: Duration, loss: Option<LossReason>) -> Packet {
        Packet {
            target: self.target.clone(),
            ip_addr: self.ip,
            addr,
            rtt,
            seq,
            nbytes,
            loss,
        }
    }

    fn sent(&self, seq: u16, nbytes: usize, now: Instant) {
        self.inflight.lock().insert(seq, now);
        if let Some(handler) = &self.handler {
            handler.on_send(&self.packet(self.ip.to_string(), seq, nbytes, Duration::ZERO, None));
        }
    }

    fn handle(&self, message: Message, from: IpAddr, nbytes: usize, now: Instant) {
        match message {
            Message::EchoReply { id, seq, tracker } => {
                // Raw sockets see every reply on the host, and identifiers
                // can collide, so the echoed tracker decides ownership.
                if (self.match_identifier && id != self.identifier) || tracker != Some(self.tracker) {
                    return;
                }
                let matched = self.inflight.lock().reply(seq, now);
                let Some(handler) = &self.handler else { return };
                match matched {
                    Matched::First(rtt) => {
                        handler.on_recv(&self.packet(from.to_string(), seq, nbytes, rtt, None))
                    }
                    Matched::Duplicate(rtt) => handler
                        .on_duplicate_recv(&self.packet(from.to_string(), seq, nbytes, rtt, None)),
                    Matched::Unknown => {}
                }
            }
            Message::Unreachable { id, seq, tracker } => {
                if self.match_identifier && id != self.identifier {
                    return;
                }
                if tracker.is_some_and(|t| t != self.tracker) {
                    return;
                }
                let elapsed = self.inflight.lock().unreachable(seq, now);
                if let (Some(rtt), Some(handler)) = (elapsed, &self.handler) {
                    handler.on_recv(&self.packet(
                        from.to_string(),
                        seq,
                        nbytes,
                        rtt,
                        Some(LossReason::Unreachable),
                    ));
                }
            }
        }
    }

    /// Report requests that went unanswered for `timeout`.
    ///
    /// Timeout losses carry the configured address as their source.
    fn expire(&self, timeout: Duration, now: Instant) {
        let lost = self.inflight.lock().expire(timeout, now);
        let Some(handler) = &self.handler else { return };
        for seq in lost {
            handler.on_recv(&self.packet(
                self.target.clone(),
                seq,
                0,
                timeout,
                Some(LossReason::Timeout),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, Packet)>>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(|(kind, _)| *kind).collect()
        }
    }

    impl PacketHandler for Recorder {
        fn on_send(&self, pkt: &Packet) {
            self.events.lock().push(("send", pkt.clone()));
        }
        fn on_recv(&self, pkt: &Packet) {
            self.events.lock().push(("recv", pkt.clone()));
        }
        fn on_duplicate_recv(&self, pkt: &Packet) {
            self.events.lock().push(("dup", pkt.clone()));
        }
    }

    const ID: u16 = 0x4242;
    const TRACKER: u64 = 0x5EED_5EED;

    fn options(address: &str) -> PingerOptions {
        PingerOptions {
            address: address.to_string(),
            size: crate::config::DEFAULT_SIZE,
            network: "ip".to_string(),
            interval: crate::config::DEFAULT_INTERVAL,
            timeout: crate::config::DEFAULT_TIMEOUT,
            privileged: true,
        }
    }

    fn reply(id: u16, seq: u16) -> Message {
        Message::EchoReply {
            id,
            seq,
            tracker: Some(TRACKER),
        }
    }

    fn dispatcher(recorder: &Arc<Recorder>, match_identifier: bool) -> Dispatcher {
        Dispatcher {
            target: "192.0.2.1".to_string(),
            ip: "192.0.2.1".parse().unwrap(),
            identifier: ID,
            tracker: TRACKER,
            match_identifier,
            inflight: Mutex::new(InFlight::default()),
            handler: Some(recorder.clone()),
        }
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("ip".parse::<Network>().unwrap(), Network::Any);
        assert_eq!("".parse::<Network>().unwrap(), Network::Any);
        assert_eq!("ip4".parse::<Network>().unwrap(), Network::V4);
        assert_eq!("ip6".parse::<Network>().unwrap(), Network::V6);
        assert!("tcp".parse::<Network>().is_err());
    }

    #[test]
    fn test_inflight_matching() {
        let mut inflight = InFlight::default();
        let t0 = Instant::now();
        inflight.insert(1, t0);

        let later = t0 + Duration::from_millis(25);
        assert_eq!(inflight.reply(1, later), Matched::First(Duration::from_millis(25)));
        assert_eq!(inflight.reply(1, later), Matched::Duplicate(Duration::from_millis(25)));
        assert_eq!(inflight.reply(2, later), Matched::Unknown);
    }

    #[test]
    fn test_inflight_expire() {
        let mut inflight = InFlight::default();
        let t0 = Instant::now();
        inflight.insert(1, t0);
        inflight.insert(2, t0);
        inflight.insert(3, t0 + Duration::from_secs(2));
        inflight.reply(2, t0 + Duration::from_millis(5));

        let lost = inflight.expire(Duration::from_secs(1), t0 + Duration::from_secs(2));
        assert_eq!(lost, vec![1]);
        // Answered entries are dropped too; later duplicates are ignored.
        assert_eq!(inflight.reply(2, t0 + Duration::from_secs(2)), Matched::Unknown);
        assert_eq!(inflight.sent.len(), 1);
    }

    #[test]
    fn test_dispatch_reply_and_duplicate() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(&recorder, true);
        let t0 = Instant::now();

        d.sent(0, 32, t0);
        let from: IpAddr = "192.0.2.1".parse().unwrap();
        d.handle(reply(ID, 0), from, 32, t0 + Duration::from_millis(10));
        d.handle(reply(ID, 0), from, 32, t0 + Duration::from_millis(12));

        assert_eq!(recorder.kinds(), vec!["send", "recv", "dup"]);
        let events = recorder.events.lock();
        assert_eq!(events[1].1.rtt, Duration::from_millis(10));
        assert_eq!(events[1].1.addr, "192.0.2.1");
        assert_eq!(events[2].1.rtt, Duration::from_millis(12));
    }

    #[test]
    fn test_dispatch_ignores_foreign_identifier() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(&recorder, true);
        let t0 = Instant::now();
        d.sent(0, 32, t0);
        d.handle(reply(1, 0), d.ip, 32, t0);
        assert_eq!(recorder.kinds(), vec!["send"]);

        // Datagram sockets skip the identifier check.
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(&recorder, false);
        d.sent(0, 32, t0);
        d.handle(reply(1, 0), d.ip, 32, t0);
        assert_eq!(recorder.kinds(), vec!["send", "recv"]);
    }

    #[test]
    fn test_reply_for_another_pinger_leaves_request_outstanding() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(&recorder, true);
        let t0 = Instant::now();
        d.sent(0, 32, t0);

        // Same identifier and sequence, but another pinger's tracker.
        let other_host: IpAddr = "198.51.100.9".parse().unwrap();
        let foreign = Message::EchoReply {
            id: ID,
            seq: 0,
            tracker: Some(TRACKER + 1),
        };
        d.handle(foreign, other_host, 32, t0 + Duration::from_millis(5));
        let truncated = Message::EchoReply {
            id: ID,
            seq: 0,
            tracker: None,
        };
        d.handle(truncated, other_host, 32, t0 + Duration::from_millis(6));
        d.expire(Duration::from_secs(1), t0 + Duration::from_secs(2));

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2, "{:?}", events);
        assert_eq!(events[0].0, "send");
        assert_eq!(events[1].0, "recv");
        assert_eq!(events[1].1.loss, Some(LossReason::Timeout));
        assert_eq!(events[1].1.addr, "192.0.2.1");
    }

    #[test]
    fn test_broadcast_replies_carry_our_tracker() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(&recorder, true);
        let t0 = Instant::now();
        d.sent(0, 32, t0);

        let neighbour: IpAddr = "192.0.2.7".parse().unwrap();
        d.handle(reply(ID, 0), neighbour, 32, t0 + Duration::from_millis(3));

        assert_eq!(recorder.kinds(), vec!["send", "recv"]);
        assert_eq!(recorder.events.lock()[1].1.addr, "192.0.2.7");
    }

    #[test]
    fn test_unreachable_for_another_pinger_ignored() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(&recorder, true);
        let t0 = Instant::now();
        d.sent(3, 32, t0);

        let router: IpAddr = "198.51.100.1".parse().unwrap();
        let foreign = Message::Unreachable {
            id: ID,
            seq: 3,
            tracker: Some(TRACKER + 1),
        };
        d.handle(foreign, router, 56, t0);
        assert_eq!(recorder.kinds(), vec!["send"]);
    }

    #[test]
    fn test_dispatch_timeout_loss() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(&recorder, true);
        let t0 = Instant::now();
        d.sent(7, 32, t0);
        d.expire(Duration::from_secs(1), t0 + Duration::from_secs(1));

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        let (kind, pkt) = &events[1];
        assert_eq!(*kind, "recv");
        assert_eq!(pkt.loss, Some(LossReason::Timeout));
        assert_eq!(pkt.addr, pkt.target);
        assert_eq!(pkt.seq, 7);
    }

    #[test]
    fn test_dispatch_unreachable_loss() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(&recorder, true);
        let t0 = Instant::now();
        d.sent(3, 32, t0);
        let router: IpAddr = "198.51.100.1".parse().unwrap();
        // Routers often quote too little of the request to carry the tracker.
        let quoted = Message::Unreachable {
            id: ID,
            seq: 3,
            tracker: None,
        };
        d.handle(quoted, router, 56, t0);
        // Already resolved; a second report or a timeout adds nothing.
        d.handle(quoted, router, 56, t0);
        d.expire(Duration::from_secs(1), t0 + Duration::from_secs(5));

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].1.loss, Some(LossReason::Unreachable));
        assert_eq!(events[1].1.addr, "198.51.100.1");
    }

    fn local_udp_socket() -> (Arc<Socket>, SocketAddr) {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        socket
            .bind(&SockAddr::from(SocketAddr::from(([127, 0, 0, 1], 0))))
            .unwrap();
        socket.set_read_timeout(Some(RECV_POLL)).unwrap();
        let addr = socket.local_addr().unwrap().as_socket().unwrap();
        (Arc::new(socket), addr)
    }

    #[test]
    fn test_receivers_run_outside_blocking_pool() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .max_blocking_threads(1)
            .build()
            .unwrap();

        runtime.block_on(async {
            let done = Arc::new(AtomicBool::new(false));
            let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let mut running = Vec::new();

            for _ in 0..3 {
                let recorder = Arc::new(Recorder::default());
                let d = Arc::new(dispatcher(&recorder, true));
                d.sent(0, 32, Instant::now());

                let (socket, addr) = local_udp_socket();
                let receiver = spawn_receiver(socket, Family::V4, d, done.clone()).unwrap();

                let mut echo = icmp::build_echo_request(Family::V4, ID, 0, TRACKER, 16);
                echo[0] = 0;
                peer.send_to(&echo, addr).unwrap();
                running.push((recorder, receiver));
            }

            for (recorder, _) in &running {
                let answered = tokio::time::timeout(Duration::from_secs(5), async {
                    while recorder.kinds() != vec!["send", "recv"] {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
                .await;
                assert!(answered.is_ok(), "events: {:?}", recorder.kinds());
            }

            done.store(true, Ordering::Release);
            for (_, receiver) in running {
                assert!(flatten_receiver(receiver.await).is_ok());
            }
        });
    }

    #[tokio::test]
    async fn test_send_echo() {
        let (sender, _) = local_udp_socket();
        let (listener, addr) = local_udp_socket();

        send_echo(sender, vec![0, 1, 2, 3], addr).await.unwrap();

        let mut buf = [MaybeUninit::<u8>::uninit(); 16];
        let (len, _) = listener.recv_from(&mut buf).unwrap();
        assert_eq!(len, 4);
    }

    #[tokio::test]
    async fn test_new_validates_options() {
        let mut opts = options("127.0.0.1");
        opts.size = 4;
        assert!(matches!(Pinger::new(opts).await, Err(ProbeError::Config(_))));

        let mut opts = options("127.0.0.1");
        opts.network = "tcp".to_string();
        assert!(matches!(Pinger::new(opts).await, Err(ProbeError::Config(_))));

        let mut opts = options("127.0.0.1");
        opts.network = "ip6".to_string();
        assert!(matches!(Pinger::new(opts).await, Err(ProbeError::Resolve { .. })));

        let mut opts = options("127.0.0.1");
        opts.interval = Duration::ZERO;
        assert!(matches!(Pinger::new(opts).await, Err(ProbeError::Config(_))));
    }

    #[tokio::test]
    async fn test_new_pinger_is_created() {
        let pinger = Pinger::new(options("127.0.0.1")).await.unwrap();
        assert_eq!(pinger.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(pinger.target(), "127.0.0.1");
        assert_eq!(pinger.state(), ProbeState::Created);

        // Stopping before start is a no-op.
        pinger.stop();
        assert_eq!(pinger.state(), ProbeState::Created);
    }

    #[tokio::test]
    async fn test_attach_once() {
        let pinger = Pinger::new(options("127.0.0.1")).await.unwrap();
        assert!(pinger.attach(Arc::new(Recorder::default())));
        assert!(!pinger.attach(Arc::new(Recorder::default())));
    }

    #[tokio::test]
    async fn test_run_stop_is_idempotent() {
        let mut opts = options("127.0.0.1");
        opts.privileged = false;
        let pinger = Arc::new(Pinger::new(opts).await.unwrap());

        let task = {
            let pinger = pinger.clone();
            tokio::spawn(async move { pinger.run().await })
        };
        while pinger.state() == ProbeState::Created {
            tokio::task::yield_now().await;
        }

        pinger.stop();
        pinger.stop();
        // Without ICMP socket permission the run fails fast; either way it ends.
        let _ = task.await.unwrap();
        assert_eq!(pinger.state(), ProbeState::Stopped);

        pinger.stop();
        assert_eq!(pinger.state(), ProbeState::Stopped);
        assert!(matches!(pinger.run().await, Err(ProbeError::AlreadyStarted)));
    }
}
