//! Compiled-in constants, CLI arguments, and the social/group mode switch
//!
//! The positional CLI mirrors the original controller script: `controller
//! <username> <password> <host> [ip4]`. Presence of `ip4` switches to group
//! VPN mode. The extra flags below don't change wire behavior; they resolve
//! ambiguities the original left to hardcoded constants (UID size, STUN/TURN
//! defaults) so an operator or a test can override them without a rebuild.

use std::time::Duration;

use clap::Parser;

/// Local data-plane agent UDP port (loopback only)
pub const SVPN_PORT: u16 = 5800;

/// Controller UDP port, dual-stack preferred
pub const CONTROLLER_PORT: u16 = 5801;

/// Receive buffer size per datagram
pub const BUF_SIZE: usize = 4096;

/// Maintenance tick interval
pub const WAIT_TIME: Duration = Duration::from_secs(30);

/// Every Nth maintenance tick in group mode also sends social heartbeats
pub const HEARTBEAT_EVERY_N_TICKS: u64 = 10;

/// Default virtual IPv4 base, social mode assigns `<prefix>.(101+n)` from this /24
pub const DEFAULT_IP4_BASE: &str = "172.31.0.100";

/// Default virtual IPv6 prefix
pub const DEFAULT_IP6_PREFIX: &str = "fd50:0dbc:41f2:4a3c";

pub const DEFAULT_STUN: &str = "stun.l.google.com:19302";
pub const DEFAULT_TURN: &str = "209.141.33.252:19302";
pub const DEFAULT_TURN_USER: &str = "svpnjingle";
pub const DEFAULT_TURN_PASS: &str = "1234567890";

/// Social mode starts assigning virtual IPv4 addresses at `.101`; the /24
/// runs out at `.254`, i.e. `101 + n <= 254` => `n <= 153`.
pub const MAX_SOCIAL_PEERS: usize = 154;

/// UID hex length. Two wire-incompatible modes exist upstream; `Current` is
/// the one shipped by the present data-plane agent (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidSize {
    /// 40 hex chars (full SHA-1 digest)
    Current,
    /// 18 hex chars, retained for interop with an intermediate data-plane version
    Legacy,
}

impl UidSize {
    pub fn len(self) -> usize {
        match self {
            UidSize::Current => 40,
            UidSize::Legacy => 18,
        }
    }
}

impl std::str::FromStr for UidSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current" => Ok(UidSize::Current),
            "legacy" => Ok(UidSize::Legacy),
            other => Err(format!("unknown uid size '{}', expected current|legacy", other)),
        }
    }
}

/// Operating mode, resolved once at construction from presence of `ip4`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Virtual IPv4 assigned sequentially; UID derived from hostname
    SocialVpn,
    /// Virtual IPv4 derived from UID; overlay forwarding and lookups enabled
    GroupVpn,
}

impl Mode {
    pub fn is_group(self) -> bool {
        matches!(self, Mode::GroupVpn)
    }
}

/// Peer-to-peer VPN controller
///
/// Drives the data-plane agent: assigns virtual addresses, exchanges
/// fingerprints and candidates, routes connection-setup notifications, and
/// (in group mode) performs overlay packet forwarding and address lookups.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Social network account username
    pub username: String,

    /// Social network account password
    pub password: String,

    /// Social network host
    pub host: String,

    /// Virtual IPv4 base address; presence switches to group VPN mode
    pub ip4: Option<String>,

    /// UID hex length: current (40 chars) or legacy (18 chars)
    #[arg(long, default_value = "current")]
    pub uid_size: UidSize,

    /// Maintenance tick interval in seconds
    #[arg(long, default_value_t = WAIT_TIME.as_secs())]
    pub wait_time: u64,

    /// STUN server for create_link
    #[arg(long, default_value = DEFAULT_STUN)]
    pub stun: String,

    /// TURN server for create_link
    #[arg(long, default_value = DEFAULT_TURN)]
    pub turn: String,

    /// TURN username
    #[arg(long, default_value = DEFAULT_TURN_USER)]
    pub turn_user: String,

    /// TURN password
    #[arg(long, default_value = DEFAULT_TURN_PASS)]
    pub turn_pass: String,
}

impl Args {
    pub fn mode(&self) -> Mode {
        if self.ip4.is_some() {
            Mode::GroupVpn
        } else {
            Mode::SocialVpn
        }
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time)
    }

    /// Rejects arguments that would leave the controller unable to make
    /// progress, before a socket is ever opened. Mirrors the fatal-config
    /// bucket of the error taxonomy, just checked a tick earlier than the
    /// conditions §4.1/§4.9 describe at runtime.
    pub fn validate(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        if let Some(ip4) = &self.ip4 {
            ip4.parse::<std::net::Ipv4Addr>()
                .with_context(|| format!("ip4 argument '{}' is not a dotted-quad address", ip4))?;
        }
        if self.wait_time == 0 {
            anyhow::bail!("--wait-time must be greater than zero");
        }
        self.stun
            .parse::<SocketAddrStr>()
            .with_context(|| format!("--stun value '{}' is not host:port", self.stun))?;
        self.turn
            .parse::<SocketAddrStr>()
            .with_context(|| format!("--turn value '{}' is not host:port", self.turn))?;
        Ok(())
    }
}

/// A `host:port` pair, parsed only to validate shape; STUN/TURN hostnames are
/// not resolved at argument-parsing time (DNS may not be up yet).
struct SocketAddrStr;

impl std::str::FromStr for SocketAddrStr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(SocketAddrStr),
            _ => Err(format!("expected host:port, got '{}'", s)),
        }
    }
}


// clap needs ValueEnum-like parsing for UidSize via FromStr; `value_parser` is
// inferred from FromStr + the fact the type isn't an enum deriving ValueEnum.
