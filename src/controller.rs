//! Controller: socket construction, bootstrap, and the single-threaded
//! blocking event loop
//!
//! No runtime, no threads, no locks: one `std::net::UdpSocket` with a read
//! timeout set to the maintenance interval serves as both the event source
//! and the tick source. A timed-out read is indistinguishable from "nothing
//! happened this tick" and drives `Scheduler::on_tick`; anything else is one
//! datagram in, handled to completion, before the next `recv_from`.

use std::net::{SocketAddr, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};

use socket2::{Domain, Protocol, Socket, Type};

use crate::address::gen_ip6;
use crate::config::{self, Args, Mode, UidSize};
use crate::errors::ControllerError;
use crate::forwarder;
use crate::lookup::LookupService;
use crate::message::{self, InboundMessage};
use crate::orchestrator::Orchestrator;
use crate::router;
use crate::rpc::RpcClient;
use crate::state::State;

/// Running counters surfaced for diagnostics; never drives control flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub rpc_sent: u64,
    pub rpc_send_failures: u64,
    pub datagrams_classified: u64,
    pub trims_issued: u64,
    pub pings_sent: u64,
}

pub struct Controller {
    socket: UdpSocket,
    rpc: RpcClient,
    orchestrator: Orchestrator,
    lookup: LookupService,
    scheduler: crate::scheduler::Scheduler,
    state: State,
    stats: Stats,
    mode: Mode,
    uid_size: UidSize,
    ip4_base: String,
    username: String,
    password: String,
    host: String,
    wait_time: std::time::Duration,
}

/// Binds the controller's own UDP socket, IPv6-preferred with an IPv4
/// fallback for hosts without IPv6 configured at all — `set_only_v6(false)`
/// so a single socket still accepts IPv4 peers mapped into `::ffff:0:0/96`.
fn bind_dual_stack(port: u16) -> Result<UdpSocket, ControllerError> {
    let v6 = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
        .and_then(|socket| {
            socket.set_only_v6(false)?;
            let addr: SocketAddr = format!("[::]:{}", port).parse().expect("valid v6 any-addr");
            socket.bind(&addr.into())?;
            Ok(socket)
        });
    if let Ok(socket) = v6 {
        return Ok(socket.into());
    }

    let v4 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).and_then(|socket| {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().expect("valid v4 any-addr");
        socket.bind(&addr.into())?;
        Ok(socket)
    });
    match v4 {
        Ok(socket) => Ok(socket.into()),
        Err(e) => Err(ControllerError::FatalConfig(format!(
            "could not bind controller socket on port {} (v6 or v4): {}",
            port, e
        ))),
    }
}

impl Controller {
    pub fn new(args: Args) -> Result<Self, ControllerError> {
        let socket = bind_dual_stack(config::CONTROLLER_PORT)?;
        Self::with_socket(socket, args)
    }

    /// Builds a `Controller` over a caller-supplied socket instead of binding
    /// `CONTROLLER_PORT` itself. Production use has no reason to reach for
    /// this over `new`; it exists so tests can drive the full dispatch path
    /// (classifier -> orchestrator/router/lookup/forwarder) over a real
    /// loopback `UdpSocket` pair without contending for the well-known port.
    pub fn with_socket(socket: UdpSocket, args: Args) -> Result<Self, ControllerError> {
        socket
            .set_read_timeout(Some(args.wait_time()))
            .map_err(|e| ControllerError::FatalConfig(format!("failed to set socket read timeout: {}", e)))?;

        let ipv6 = socket.local_addr().map(|a| a.is_ipv6()).unwrap_or(true);
        let mode = args.mode();
        let ip4_base = args.ip4.clone().unwrap_or_else(|| config::DEFAULT_IP4_BASE.to_string());

        Ok(Controller {
            socket,
            rpc: RpcClient::new(ipv6),
            orchestrator: Orchestrator {
                mode,
                uid_size: args.uid_size,
                ip4_base: ip4_base.clone(),
                stun: args.stun.clone(),
                turn: args.turn.clone(),
                turn_user: args.turn_user.clone(),
                turn_pass: args.turn_pass.clone(),
            },
            lookup: LookupService,
            scheduler: crate::scheduler::Scheduler::new(args.wait_time().as_secs()),
            state: State::new(),
            stats: Stats::default(),
            mode,
            uid_size: args.uid_size,
            ip4_base,
            username: args.username.clone(),
            password: args.password.clone(),
            host: args.host.clone(),
            wait_time: args.wait_time(),
        })
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Registers with the social network service and primes the data plane
    /// with our callback address and an initial state request. Runs once,
    /// before entering the event loop.
    pub fn start(&mut self) {
        self.rpc
            .register_service(&self.socket, &mut self.stats, &self.username, &self.password, &self.host);
        if let Ok(addr) = self.socket.local_addr() {
            self.rpc.set_callback(&self.socket, &mut self.stats, addr);
        }
        self.rpc.get_state(&self.socket, &mut self.stats);
        tracing::info!(mode = ?self.mode, wait_time = ?self.wait_time, "controller started");
    }

    /// Assigns our own UID and virtual addresses and pushes them to the
    /// data plane. Runs once, the first time a snapshot comes back with an
    /// empty `_uid` (the data plane hasn't been told who we are yet).
    fn bootstrap(&mut self) {
        let (uid, ip4) = match self.mode {
            Mode::GroupVpn => {
                let uid = crate::address::gen_uid(&self.ip4_base, self.uid_size);
                (uid, self.ip4_base.clone())
            }
            Mode::SocialVpn => {
                // The username doubles as the stable identity seed (the
                // original derives the UID from the hostname); fall back to
                // a random UID on the rare path where no seed is available
                // at all, per the Address Coder's spec.
                let uid = if self.username.is_empty() {
                    crate::address::gen_uid_random(self.uid_size)
                } else {
                    crate::address::gen_uid(&self.username, self.uid_size)
                };
                let ip4 = crate::address::gen_ip4_social(0, &self.ip4_base).unwrap_or_else(|_| self.ip4_base.clone());
                (uid, ip4)
            }
        };
        let ip6 = gen_ip6(&uid, config::DEFAULT_IP6_PREFIX);
        tracing::info!(%uid, %ip4, %ip6, "bootstrapping local identity");
        self.rpc.set_local_ip(&self.socket, &mut self.stats, &uid, &ip4, &ip6);
    }

    /// Classifies and dispatches one already-received datagram. Exposed so
    /// tests can drive the controller deterministically, one datagram at a
    /// time, instead of racing a real socket against `run`'s blocking loop.
    pub fn handle_datagram(&mut self, buf: &[u8], src: SocketAddr) -> Result<(), ControllerError> {
        let fpr_len = if self.state.has_fpr() {
            Some(self.state.self_fpr().len())
        } else {
            None
        };
        match message::classify(buf, fpr_len) {
            Ok(Some(msg)) => {
                self.stats.datagrams_classified += 1;
                self.dispatch(msg, src)?;
            }
            Ok(None) => tracing::trace!(%src, "dropped ambiguous or premature datagram"),
            Err(e) => tracing::warn!(%src, error = %e, "malformed datagram"),
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: InboundMessage, src: SocketAddr) -> Result<(), ControllerError> {
        match msg {
            InboundMessage::StateSnapshot(snapshot) => {
                let needs_bootstrap = self.state.apply_snapshot(snapshot, &self.ip4_base);
                if needs_bootstrap {
                    self.bootstrap();
                }
            }
            InboundMessage::PeerStatus(update) => self.state.record_peer_status(update),
            InboundMessage::RawPacket(bytes) => {
                if self.mode.is_group() {
                    forwarder::forward(&self.socket, self.rpc.dest(), &mut self.stats, &self.state, &bytes);
                }
            }
            InboundMessage::Lookup { ip4, ip6 } => self.lookup.handle_lookup(
                &self.socket,
                &mut self.stats,
                &self.state,
                src,
                self.mode.is_group(),
                ip4.as_deref(),
                ip6.as_deref(),
            ),
            InboundMessage::NcLookup { ip4, ip6 } => self.lookup.handle_nc_lookup(
                &self.socket,
                &mut self.stats,
                &self.state,
                self.mode.is_group(),
                ip4.as_deref(),
                ip6.as_deref(),
            ),
            InboundMessage::Discover => {
                self.lookup
                    .handle_discover(&self.socket, &mut self.stats, &self.state, src, self.mode.is_group())
            }
            notification @ (InboundMessage::Discovery { .. }
            | InboundMessage::ConnectionRequest { .. }
            | InboundMessage::Ip4Update { .. }) => router::route(
                &self.socket,
                &self.rpc,
                &self.orchestrator,
                &mut self.stats,
                &mut self.state,
                src,
                src.ip().is_loopback(),
                notification,
            )?,
        }
        Ok(())
    }

    fn now_secs(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }

    /// Runs one maintenance pass at the given timestamp, as if the read
    /// timeout had just fired. Exposed for tests that need deterministic
    /// control over tick timing rather than waiting out a real timeout.
    pub fn tick_at(&mut self, now: u64) {
        let rpc = self.rpc.clone();
        self.scheduler.on_tick(&self.socket, &rpc, &mut self.stats, &mut self.state, now);
    }

    /// Runs forever. The only way out is a fatal I/O error on the socket
    /// itself (not a timeout, not a malformed datagram); the caller's `main`
    /// maps that to a non-zero exit code.
    pub fn run(&mut self) -> Result<(), ControllerError> {
        self.start();
        let mut buf = vec![0u8; config::BUF_SIZE];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, src)) => {
                    let data = buf[..n].to_vec();
                    self.handle_datagram(&data, src)?;
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    let now = self.now_secs();
                    self.tick_at(now);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "socket read failed");
                }
            }
        }
    }
}
