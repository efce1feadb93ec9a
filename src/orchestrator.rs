//! Connection Orchestrator
//!
//! Turns a `Discovery` or `ConnectionRequest` into data-plane RPCs: assigns
//! the peer's virtual address (mode-dependent), remembers it in the
//! peerlist, and issues `create_link` / `set_remote_ip` / `get_state` in that
//! order so the data plane has the link before it's told where to route
//! traffic for it.

use std::net::UdpSocket;

use crate::address::{gen_ip4_group, gen_ip4_social};
use crate::config::{Mode, UidSize};
use crate::controller::Stats;
use crate::errors::ControllerError;
use crate::rpc::RpcClient;
use crate::state::State;

pub struct Orchestrator {
    pub mode: Mode,
    pub uid_size: UidSize,
    pub ip4_base: String,
    pub stun: String,
    pub turn: String,
    pub turn_user: String,
    pub turn_pass: String,
}

impl Orchestrator {
    /// Assigns (or resolves) a virtual IPv4 for `uid`, per mode.
    ///
    /// Group mode derives it from the UID by reverse lookup over the
    /// configured /24; a peer whose address can't be recovered there has no
    /// virtual address and is skipped (`Ok(None)`). Social mode assigns the
    /// next free host octet and requires no prior relationship between UID
    /// and address; once the /24 is exhausted this is a fatal configuration
    /// error (`Err`), not an ordinary miss, since there is no peer to ask for
    /// an alternate address the way group mode can.
    fn assign_ip4(&self, uid: &str, state: &State) -> Result<Option<String>, ControllerError> {
        match self.mode {
            Mode::GroupVpn => Ok(gen_ip4_group(uid, &self.ip4_base, self.uid_size)),
            Mode::SocialVpn => gen_ip4_social(state.peerlist.len(), &self.ip4_base)
                .map(Some)
                .map_err(ControllerError::FatalConfig),
        }
    }

    /// Handles a `Discovery` (bare fingerprint, no candidates yet) or
    /// `ConnectionRequest` (fingerprint + ICE candidates) notification.
    ///
    /// `cas` is empty for a plain discovery. Self-notifications (our own
    /// UID looped back through a broadcast) are filtered before this is
    /// called; see `router::route`. `ip4`, when the caller already knows the
    /// peer's virtual address (e.g. it arrived on the notification itself),
    /// skips address assignment entirely. `nid` encodes how the request
    /// arrived: `1` over the social layer (loopback), `0` from another
    /// controller — the caller decides this from the datagram's source, not
    /// from the controller's mode.
    ///
    /// Returns `Err(ControllerError::FatalConfig)` only when social-mode
    /// address assignment has exhausted its configured /24 — a condition the
    /// caller must treat as unrecoverable and abort on, not log-and-continue.
    #[allow(clippy::too_many_arguments)]
    pub fn create_connection(
        &self,
        socket: &UdpSocket,
        rpc: &RpcClient,
        stats: &mut Stats,
        state: &mut State,
        uid: &str,
        fpr: &str,
        nid: u8,
        cas: &str,
        ip4: Option<&str>,
        sec: bool,
    ) -> Result<(), ControllerError> {
        if uid == state.self_uid() {
            return Ok(());
        }

        let ip4 = match ip4 {
            Some(ip4) => ip4.to_string(),
            None => match self.assign_ip4(uid, state)? {
                Some(ip4) => ip4,
                None => {
                    if self.mode.is_group() {
                        // Group mode derives ip4 from the uid; when that fails
                        // (uid outside the configured /24) ask the peer to
                        // advertise its own address instead of giving up silently.
                        rpc.send_msg(socket, stats, 1, uid, &format!("ip4:{}", self.ip4_base));
                    } else {
                        tracing::debug!("no virtual address could be assigned for peer {}", uid);
                    }
                    return Ok(());
                }
            },
        };
        let ip6 = crate::address::gen_ip6(uid, crate::config::DEFAULT_IP6_PREFIX);

        state.peerlist.insert(uid.to_string());

        rpc.create_link(
            socket,
            stats,
            uid,
            fpr,
            nid,
            &self.stun,
            &self.turn,
            &self.turn_user,
            &self.turn_pass,
            sec,
            cas,
        );
        rpc.set_remote_ip(socket, stats, uid, &ip4, &ip6);
        rpc.get_state(socket, stats);
        Ok(())
    }

    /// Handles an `Ip4Update` notification: a peer reporting its own
    /// overlay-assigned address back to us (social mode only; group mode
    /// never needs this since the address is derivable).
    pub fn update_remote_ip4(&self, socket: &UdpSocket, rpc: &RpcClient, stats: &mut Stats, uid: &str, ip4: &str) {
        let ip6 = crate::address::gen_ip6(uid, crate::config::DEFAULT_IP6_PREFIX);
        rpc.set_remote_ip(socket, stats, uid, ip4, &ip6);
    }
}
