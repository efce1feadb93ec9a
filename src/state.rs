//! State Cache: the controller's view of its own identity and the peer table
//!
//! Holds the most recent snapshot reported by the data plane plus a derived
//! routing index (virtual IPv4/IPv6 -> peer controller IPv6), rebuilt on
//! every snapshot. Per-peer status updates (a narrower message than the full
//! snapshot) are tracked separately, matching the wire distinction in
//! `message::InboundMessage`.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Online/offline/unknown status of a peer as reported by the data plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
    Unknown,
}

/// A single entry in the data plane's peer table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub uid: String,
    #[serde(default)]
    pub fpr: String,
    #[serde(default)]
    pub ip4: String,
    #[serde(default)]
    pub ip6: String,
    #[serde(default = "default_status")]
    pub status: PeerStatus,
    #[serde(default)]
    pub last_time: u64,
}

fn default_status() -> PeerStatus {
    PeerStatus::Unknown
}

/// The full state snapshot sent by the data plane: `{_uid, _fpr, _ip4, _ip6,
/// peers}`. Identified on the wire by presence of `_fpr` or `_uid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default, rename = "_uid")]
    pub uid: String,
    #[serde(default, rename = "_fpr")]
    pub fpr: String,
    #[serde(default, rename = "_ip4")]
    pub ip4: String,
    #[serde(default, rename = "_ip6")]
    pub ip6: String,
    #[serde(default)]
    pub peers: HashMap<String, PeerRecord>,
}

/// Narrower peer status update: `{uid, status, ...}` without a leading `_`
/// key, so it can be told apart from a full snapshot at the wire level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatusUpdate {
    pub uid: String,
    pub status: PeerStatus,
    #[serde(default)]
    pub last_time: u64,
}

/// Routing index: packed virtual address -> peer controller's IPv6 address.
///
/// Rebuilt wholesale from the peer table on every snapshot (group mode only;
/// social mode never populates it).
#[derive(Debug, Clone, Default)]
pub struct RoutingIndex {
    pub by_ip4: HashMap<Ipv4Addr, String>,
    pub by_ip6: HashMap<String, String>,
    pub by_uid: HashMap<String, String>,
}

impl RoutingIndex {
    pub fn rebuild(peers: &HashMap<String, PeerRecord>) -> Self {
        let mut by_ip4 = HashMap::new();
        let mut by_ip6 = HashMap::new();
        let mut by_uid = HashMap::new();
        for peer in peers.values() {
            if peer.ip6.is_empty() {
                continue;
            }
            if let Ok(addr) = peer.ip4.parse::<Ipv4Addr>() {
                by_ip4.insert(addr, peer.ip6.clone());
            }
            by_ip6.insert(peer.ip6.clone(), peer.ip6.clone());
            by_uid.insert(peer.uid.clone(), peer.ip6.clone());
        }
        RoutingIndex { by_ip4, by_ip6, by_uid }
    }

    pub fn first_controller(&self) -> Option<&str> {
        self.by_ip4.values().next().map(String::as_str)
    }

    /// Resolves the overlay controller address for a peer by UID, used when
    /// forwarding a notification addressed to a specific third party.
    pub fn controller_for_uid(&self, uid: &str) -> Option<&str> {
        self.by_uid.get(uid).map(String::as_str)
    }
}

/// The controller's in-memory state: current snapshot, peer status cache,
/// routing index, and the monotonically growing peerlist used for social
/// mode's sequential IPv4 assignment.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub snapshot: Option<StateSnapshot>,
    pub peer_status: HashMap<String, PeerStatusUpdate>,
    pub routing: RoutingIndex,
    pub peerlist: std::collections::HashSet<String>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a snapshot with a non-empty `_fpr` has been observed; the
    /// classifier drops everything else until this is true.
    pub fn has_fpr(&self) -> bool {
        self.snapshot.as_ref().is_some_and(|s| !s.fpr.is_empty())
    }

    pub fn self_uid(&self) -> &str {
        self.snapshot.as_ref().map(|s| s.uid.as_str()).unwrap_or("")
    }

    pub fn self_fpr(&self) -> &str {
        self.snapshot.as_ref().map(|s| s.fpr.as_str()).unwrap_or("")
    }

    pub fn self_ip4(&self) -> &str {
        self.snapshot.as_ref().map(|s| s.ip4.as_str()).unwrap_or("")
    }

    pub fn self_ip6(&self) -> &str {
        self.snapshot.as_ref().map(|s| s.ip6.as_str()).unwrap_or("")
    }

    pub fn peer(&self, uid: &str) -> Option<&PeerRecord> {
        self.snapshot.as_ref().and_then(|s| s.peers.get(uid))
    }

    pub fn online_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.snapshot
            .iter()
            .flat_map(|s| s.peers.values())
            .filter(|p| p.status == PeerStatus::Online)
    }

    /// Replaces the cached snapshot, adopting `_ip4` if the controller was
    /// constructed without one (group mode always supplies its own, social
    /// mode may start empty and take whatever the data plane assigns), and
    /// rebuilding the routing index from the fresh peer table. Returns
    /// `true` if this snapshot still needs bootstrap (`_uid` is empty).
    pub fn apply_snapshot(&mut self, mut incoming: StateSnapshot, configured_ip4: &str) -> bool {
        if incoming.ip4.is_empty() && !configured_ip4.is_empty() {
            incoming.ip4 = configured_ip4.to_string();
        }
        let needs_bootstrap = incoming.uid.is_empty();
        self.routing = RoutingIndex::rebuild(&incoming.peers);
        self.snapshot = Some(incoming);
        needs_bootstrap
    }

    pub fn record_peer_status(&mut self, update: PeerStatusUpdate) {
        self.peer_status.insert(update.uid.clone(), update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(uid: &str, fpr: &str, ip4: &str) -> StateSnapshot {
        StateSnapshot {
            uid: uid.to_string(),
            fpr: fpr.to_string(),
            ip4: ip4.to_string(),
            ip6: String::new(),
            peers: HashMap::new(),
        }
    }

    #[test]
    fn apply_snapshot_reports_bootstrap_need_when_uid_empty() {
        let mut state = State::new();
        let needs_bootstrap = state.apply_snapshot(snapshot("", "", "172.31.0.100"), "");
        assert!(needs_bootstrap);
        assert_eq!(state.self_ip4(), "172.31.0.100");
    }

    #[test]
    fn apply_snapshot_adopts_configured_ip4_only_when_missing() {
        let mut state = State::new();
        let mut snap = snapshot("uid1", "fpr1", "");
        snap.ip4.clear();
        state.apply_snapshot(snap, "10.1.0.5");
        assert_eq!(state.self_ip4(), "10.1.0.5");
    }

    #[test]
    fn routing_index_skips_peers_without_ip6() {
        let mut peers = HashMap::new();
        peers.insert(
            "p1".to_string(),
            PeerRecord {
                uid: "p1".to_string(),
                fpr: "fpr".to_string(),
                ip4: "10.1.0.7".to_string(),
                ip6: String::new(),
                status: PeerStatus::Online,
                last_time: 0,
            },
        );
        let idx = RoutingIndex::rebuild(&peers);
        assert!(idx.by_ip4.is_empty());
    }
}
