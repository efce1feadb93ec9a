//! Maintenance Scheduler
//!
//! Driven by the event loop's read-timeout tick, not a separate timer
//! thread: every `WAIT_TIME` without a datagram arriving, `on_tick` runs
//! once. It asks the data plane for a fresh state snapshot and trims any
//! peer that's been offline for more than `2*WAIT_TIME`, pings every known
//! peer controller directly, and — every `HEARTBEAT_EVERY_N_TICKS` ticks —
//! additionally re-sends our fingerprint over the social channel to every
//! known peer, so a link that only ever learned our address through a
//! one-shot invitation doesn't silently rot if that first datagram was lost.

use std::net::{SocketAddr, UdpSocket};

use serde_json::json;

use crate::config::CONTROLLER_PORT;
use crate::controller::Stats;
use crate::rpc::RpcClient;
use crate::state::{PeerStatus, State};

pub struct Scheduler {
    ticks: u64,
    wait_time_secs: u64,
}

impl Scheduler {
    pub fn new(wait_time_secs: u64) -> Self {
        Scheduler { ticks: 0, wait_time_secs }
    }

    fn trim_after_secs(&self) -> u64 {
        2 * self.wait_time_secs
    }

    /// Runs one maintenance pass. `now` is the caller's notion of current
    /// time in seconds (epoch or monotonic, as long as it's comparable to
    /// `PeerRecord::last_time`), passed in rather than read from the clock
    /// so this is deterministically testable.
    pub fn on_tick(&mut self, socket: &UdpSocket, rpc: &RpcClient, stats: &mut Stats, state: &mut State, now: u64) {
        self.ticks += 1;

        self.trim_stale_peers(socket, rpc, stats, state, now);
        rpc.get_state(socket, stats);
        self.ping_all_controllers(socket, stats, state);

        if self.ticks % crate::config::HEARTBEAT_EVERY_N_TICKS == 0 {
            self.send_social_heartbeats(socket, rpc, stats, state);
        }
    }

    fn trim_stale_peers(&self, socket: &UdpSocket, rpc: &RpcClient, stats: &mut Stats, state: &mut State, now: u64) {
        let threshold = self.trim_after_secs();
        let stale: Vec<String> = state
            .snapshot
            .iter()
            .flat_map(|s| s.peers.values())
            .filter(|p| p.status == PeerStatus::Offline && now.saturating_sub(p.last_time) > threshold)
            .map(|p| p.uid.clone())
            .collect();
        for uid in &stale {
            rpc.trim_link(socket, stats, uid);
            stats.trims_issued += 1;
        }
    }

    /// Direct UDP ping to every peer controller we have a route to, every
    /// tick regardless of the heartbeat cadence — this is the cheap signal
    /// that keeps a NAT binding or firewall pinhole open between ticks.
    fn ping_all_controllers(&self, socket: &UdpSocket, stats: &mut Stats, state: &State) {
        let self_uid = state.self_uid();
        if self_uid.is_empty() {
            return;
        }
        let payload = json!({"m": "ping", "uid": self_uid});
        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("failed to encode ping: {}", e);
                return;
            }
        };
        for ip6 in state.routing.by_uid.values() {
            send_to_ip6(socket, stats, ip6, &bytes);
        }
        stats.pings_sent += 1;
    }

    /// Social-channel re-announcement: asks the data plane to deliver our
    /// fingerprint to every peer we already know about, the same `send_msg`
    /// the Orchestrator uses for a cold `ip4:` request.
    fn send_social_heartbeats(&self, socket: &UdpSocket, rpc: &RpcClient, stats: &mut Stats, state: &State) {
        let self_uid = state.self_uid().to_string();
        let self_fpr = state.self_fpr().to_string();
        if self_uid.is_empty() || self_fpr.is_empty() {
            return;
        }
        let peers: Vec<String> = state.snapshot.iter().flat_map(|s| s.peers.keys().cloned()).collect();
        for uid in peers {
            rpc.send_msg(socket, stats, 1, &uid, &self_fpr);
        }
    }
}

fn send_to_ip6(socket: &UdpSocket, stats: &mut Stats, ip6: &str, bytes: &[u8]) {
    let dest = format!("[{}]:{}", ip6, CONTROLLER_PORT);
    match dest.parse::<SocketAddr>() {
        Ok(addr) => match socket.send_to(bytes, addr) {
            Ok(_) => stats.rpc_sent += 1,
            Err(e) => {
                stats.rpc_send_failures += 1;
                tracing::warn!("failed to ping {}: {}", addr, e);
            }
        },
        Err(e) => tracing::warn!("bad controller address {}: {}", dest, e),
    }
}
