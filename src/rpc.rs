//! Data-Plane RPC Client
//!
//! Builds the fixed verb set the data plane understands and writes each as a
//! single JSON datagram to (loopback, SVPN_PORT). Every call is fire-and-
//! forget: UDP send failures are logged and counted (`Stats::rpc_send_failures`)
//! rather than propagated, since the data plane's replies (if any) arrive
//! asynchronously as ordinary datagrams on the controller's own socket.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use serde_json::json;

use crate::config::SVPN_PORT;
use crate::controller::Stats;

/// Addresses the local data-plane agent over loopback
#[derive(Clone, Copy)]
pub struct RpcClient {
    dest: SocketAddr,
}

impl RpcClient {
    /// `ipv6` selects `(::1, SVPN_PORT)`; otherwise `(127.0.0.1, SVPN_PORT)`,
    /// matching whichever family the controller's own socket bound.
    pub fn new(ipv6: bool) -> Self {
        let ip: IpAddr = if ipv6 {
            "::1".parse().expect("loopback v6 parses")
        } else {
            "127.0.0.1".parse().expect("loopback v4 parses")
        };
        RpcClient {
            dest: SocketAddr::new(ip, SVPN_PORT),
        }
    }

    fn send(&self, socket: &UdpSocket, stats: &mut Stats, verb: &str, value: serde_json::Value) {
        let bytes = match serde_json::to_vec(&value) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("failed to encode {} request: {}", verb, e);
                return;
            }
        };
        match socket.send_to(&bytes, self.dest) {
            Ok(_) => {
                stats.rpc_sent += 1;
                tracing::debug!("-> data plane {}: {}", verb, value);
            }
            Err(e) => {
                stats.rpc_send_failures += 1;
                tracing::warn!("failed to send {} to data plane: {}", verb, e);
            }
        }
    }

    pub fn set_callback(&self, socket: &UdpSocket, stats: &mut Stats, addr: SocketAddr) {
        self.send(
            socket,
            stats,
            "set_callback",
            json!({"m": "set_callback", "ip": addr.ip().to_string(), "port": addr.port()}),
        );
    }

    pub fn register_service(
        &self,
        socket: &UdpSocket,
        stats: &mut Stats,
        username: &str,
        password: &str,
        host: &str,
    ) {
        self.send(
            socket,
            stats,
            "register_service",
            json!({"m": "register_service", "username": username, "password": password, "host": host}),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_link(
        &self,
        socket: &UdpSocket,
        stats: &mut Stats,
        uid: &str,
        fpr: &str,
        nid: u8,
        stun: &str,
        turn: &str,
        turn_user: &str,
        turn_pass: &str,
        sec: bool,
        cas: &str,
    ) {
        self.send(
            socket,
            stats,
            "create_link",
            json!({
                "m": "create_link",
                "uid": uid,
                "fpr": fpr,
                "nid": nid,
                "stun": stun,
                "turn": turn,
                "turn_user": turn_user,
                "turn_pass": turn_pass,
                "sec": sec,
                "cas": cas,
            }),
        );
    }

    pub fn trim_link(&self, socket: &UdpSocket, stats: &mut Stats, uid: &str) {
        self.send(socket, stats, "trim_link", json!({"m": "trim_link", "uid": uid}));
    }

    pub fn set_local_ip(&self, socket: &UdpSocket, stats: &mut Stats, uid: &str, ip4: &str, ip6: &str) {
        self.send(
            socket,
            stats,
            "set_local_ip",
            json!({
                "m": "set_local_ip",
                "uid": uid,
                "ip4": ip4,
                "ip6": ip6,
                "ip4_mask": 24,
                "ip6_mask": 64,
            }),
        );
    }

    pub fn set_remote_ip(&self, socket: &UdpSocket, stats: &mut Stats, uid: &str, ip4: &str, ip6: &str) {
        self.send(
            socket,
            stats,
            "set_remote_ip",
            json!({"m": "set_remote_ip", "uid": uid, "ip4": ip4, "ip6": ip6}),
        );
    }

    pub fn send_msg(&self, socket: &UdpSocket, stats: &mut Stats, nid: u8, uid: &str, data: &str) {
        self.send(
            socket,
            stats,
            "send_msg",
            json!({"m": "send_msg", "nid": nid, "uid": uid, "data": data}),
        );
    }

    pub fn get_state(&self, socket: &UdpSocket, stats: &mut Stats) {
        self.send(socket, stats, "get_state", json!({"m": "get_state"}));
    }

    /// The loopback address this client addresses, for handing encapsulated
    /// packets down to the data plane without going through a named verb.
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }
}
