//! Overlay Lookup Service (group VPN mode only)
//!
//! Answers `lookup`/`nc_lookup`/`discover` requests arriving from a peer
//! controller (or, for `nc_lookup`, from the local data plane via loopback):
//!
//! - `lookup`: scan our own peer table for an entry whose `ip4` or `ip6`
//!   matches the query, and reply directly to the requester's address
//!   (the `src` the datagram arrived from) with `{uid, data: fpr, ip4}`.
//! - `nc_lookup`: we don't answer this ourselves — it means "ask the whole
//!   overlay", so it's re-broadcast as `lookup` to every controller in the
//!   routing index.
//! - `discover` (legacy): enumerate our online peers and reply to the
//!   requester with one `{uid, data: fpr}` datagram per peer.
//!
//! All three replies carry a `data` field, so they re-enter through the
//! Classifier on the requester's side and are treated as ordinary connection
//! notifications — no separate reply-handling path is needed there.

use std::net::{SocketAddr, UdpSocket};

use serde_json::json;

use crate::config::CONTROLLER_PORT;
use crate::controller::Stats;
use crate::state::{PeerRecord, State};

pub struct LookupService;

impl LookupService {
    /// Responds to a `lookup` query by scanning our own peer table.
    /// No-op outside group mode: social mode keeps no address-indexed table
    /// to answer from.
    pub fn handle_lookup(
        &self,
        socket: &UdpSocket,
        stats: &mut Stats,
        state: &State,
        src: SocketAddr,
        is_group: bool,
        ip4: Option<&str>,
        ip6: Option<&str>,
    ) {
        if !is_group {
            tracing::debug!("lookup request ignored outside group mode");
            return;
        }
        let peer = match find_peer(state, ip4, ip6) {
            Some(p) => p,
            None => {
                tracing::debug!("lookup found no match for {:?}/{:?}", ip4, ip6);
                return;
            }
        };
        let reply = json!({"uid": peer.uid, "data": peer.fpr, "ip4": peer.ip4});
        send_unicast(socket, stats, src, &reply);
    }

    /// Re-broadcasts an `nc_lookup` as `lookup` to every controller we have
    /// a route to; the reply (if any) goes straight back to whoever asked,
    /// not through us, since each recipient replies to the datagram's source.
    pub fn handle_nc_lookup(&self, socket: &UdpSocket, stats: &mut Stats, state: &State, is_group: bool, ip4: Option<&str>, ip6: Option<&str>) {
        if !is_group {
            tracing::debug!("nc_lookup ignored outside group mode");
            return;
        }
        let mut value = json!({"m": "lookup"});
        if let Some(ip4) = ip4 {
            value["ip4"] = json!(ip4);
        }
        if let Some(ip6) = ip6 {
            value["ip6"] = json!(ip6);
        }
        for ip6 in state.routing.by_uid.values() {
            send_unicast_ip6(socket, stats, ip6, &value);
        }
    }

    /// Responds to a `discover` query by listing every peer we currently
    /// see online, one reply datagram per peer. No-op outside group mode,
    /// same as `lookup`/`nc_lookup`.
    pub fn handle_discover(&self, socket: &UdpSocket, stats: &mut Stats, state: &State, src: SocketAddr, is_group: bool) {
        if !is_group {
            tracing::debug!("discover request ignored outside group mode");
            return;
        }
        for peer in state.online_peers() {
            let reply = json!({"uid": peer.uid, "data": peer.fpr});
            send_unicast(socket, stats, src, &reply);
        }
    }
}

/// Sends a one-shot `lookup` query to a single controller, used by the
/// Packet Forwarder to keep the routing index warm before tunneling a
/// packet to an address it hasn't resolved recently.
pub fn send_lookup_query(socket: &UdpSocket, stats: &mut Stats, dest_ip6: &str, ip4: Option<&str>) {
    send_lookup_query_for(socket, stats, dest_ip6, ip4, None);
}

/// As `send_lookup_query`, but for a destination named by its virtual IPv6
/// address rather than IPv4 (a query about an IPv6-addressed overlay peer).
pub fn send_lookup_query_for(
    socket: &UdpSocket,
    stats: &mut Stats,
    dest_ip6: &str,
    ip4: Option<&str>,
    ip6: Option<&str>,
) {
    let mut value = json!({"m": "lookup"});
    if let Some(ip4) = ip4 {
        value["ip4"] = json!(ip4);
    }
    if let Some(ip6) = ip6 {
        value["ip6"] = json!(ip6);
    }
    send_unicast_ip6(socket, stats, dest_ip6, &value);
}

fn find_peer<'a>(state: &'a State, ip4: Option<&str>, ip6: Option<&str>) -> Option<&'a PeerRecord> {
    let snapshot = state.snapshot.as_ref()?;
    snapshot.peers.values().find(|p| {
        p.status == crate::state::PeerStatus::Online
            && ((ip4.is_some() && !p.ip4.is_empty() && ip4 == Some(p.ip4.as_str()))
                || (ip6.is_some() && !p.ip6.is_empty() && ip6 == Some(p.ip6.as_str())))
    })
}

fn send_unicast(socket: &UdpSocket, stats: &mut Stats, dest: SocketAddr, value: &serde_json::Value) {
    let bytes = match serde_json::to_vec(value) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("failed to encode lookup reply: {}", e);
            return;
        }
    };
    match socket.send_to(&bytes, dest) {
        Ok(_) => stats.rpc_sent += 1,
        Err(e) => {
            stats.rpc_send_failures += 1;
            tracing::warn!("failed to send lookup reply to {}: {}", dest, e);
        }
    }
}

fn send_unicast_ip6(socket: &UdpSocket, stats: &mut Stats, ip6: &str, value: &serde_json::Value) {
    let dest = format!("[{}]:{}", ip6, CONTROLLER_PORT);
    match dest.parse::<SocketAddr>() {
        Ok(addr) => send_unicast(socket, stats, addr, value),
        Err(e) => tracing::warn!("bad controller address {}: {}", dest, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{PeerStatus, StateSnapshot};
    use std::collections::HashMap;

    fn state_with_peer(uid: &str, fpr: &str, ip4: &str, ip6: &str, status: PeerStatus) -> State {
        let mut peers = HashMap::new();
        peers.insert(
            uid.to_string(),
            PeerRecord {
                uid: uid.to_string(),
                fpr: fpr.to_string(),
                ip4: ip4.to_string(),
                ip6: ip6.to_string(),
                status,
                last_time: 0,
            },
        );
        let mut state = State::new();
        state.apply_snapshot(
            StateSnapshot {
                uid: "self".to_string(),
                fpr: "f".repeat(40),
                ip4: "10.8.0.1".to_string(),
                ip6: String::new(),
                peers,
            },
            "",
        );
        state
    }

    #[test]
    fn find_peer_matches_by_ip4() {
        let state = state_with_peer("p1", "fprX", "10.8.0.7", "", PeerStatus::Online);
        let found = find_peer(&state, Some("10.8.0.7"), None).unwrap();
        assert_eq!(found.uid, "p1");
    }

    #[test]
    fn find_peer_matches_by_ip6_when_ip4_absent() {
        let state = state_with_peer("p1", "fprX", "", "fd50::1", PeerStatus::Online);
        let found = find_peer(&state, None, Some("fd50::1")).unwrap();
        assert_eq!(found.uid, "p1");
    }

    #[test]
    fn find_peer_returns_none_for_unknown_address() {
        let state = state_with_peer("p1", "fprX", "10.8.0.7", "", PeerStatus::Online);
        assert!(find_peer(&state, Some("10.8.0.9"), None).is_none());
    }

    #[test]
    fn find_peer_ignores_offline_peers() {
        let state = state_with_peer("p1", "fprX", "10.8.0.7", "", PeerStatus::Offline);
        assert!(find_peer(&state, Some("10.8.0.7"), None).is_none());
    }

    #[test]
    fn handle_lookup_replies_to_requester() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let requester = UdpSocket::bind("127.0.0.1:0").unwrap();
        let requester_addr = requester.local_addr().unwrap();
        let mut stats = Stats::default();
        let state = state_with_peer("p1", "fprX", "10.8.0.7", "", PeerStatus::Online);
        let svc = LookupService;

        svc.handle_lookup(&socket, &mut stats, &state, requester_addr, true, Some("10.8.0.7"), None);

        assert_eq!(stats.rpc_sent, 1);
        requester.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 256];
        let (n, _) = requester.recv_from(&mut buf).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(value["uid"], "p1");
        assert_eq!(value["data"], "fprX");
    }

    #[test]
    fn handle_lookup_outside_group_mode_is_noop() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut stats = Stats::default();
        let state = state_with_peer("p1", "fprX", "10.8.0.7", "", PeerStatus::Online);
        let svc = LookupService;
        svc.handle_lookup(&socket, &mut stats, &state, "127.0.0.1:1".parse().unwrap(), false, Some("10.8.0.7"), None);
        assert_eq!(stats.rpc_sent, 0);
    }

    #[test]
    fn handle_discover_outside_group_mode_is_noop() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut stats = Stats::default();
        let state = state_with_peer("p1", "fprX", "10.8.0.7", "", PeerStatus::Online);
        let svc = LookupService;
        svc.handle_discover(&socket, &mut stats, &state, "127.0.0.1:1".parse().unwrap(), false);
        assert_eq!(stats.rpc_sent, 0);
    }

    #[test]
    fn handle_discover_replies_with_online_peers() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let requester = UdpSocket::bind("127.0.0.1:0").unwrap();
        let requester_addr = requester.local_addr().unwrap();
        let mut stats = Stats::default();
        let state = state_with_peer("p1", "fprX", "10.8.0.7", "", PeerStatus::Online);
        let svc = LookupService;

        svc.handle_discover(&socket, &mut stats, &state, requester_addr, true);

        assert_eq!(stats.rpc_sent, 1);
        requester.set_read_timeout(Some(std::time::Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 256];
        let (n, _) = requester.recv_from(&mut buf).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(value["uid"], "p1");
        assert_eq!(value["data"], "fprX");
    }
}
