//! Packet Forwarder (group VPN mode only)
//!
//! Handles `InboundMessage::RawPacket`: an encapsulated IP packet, arriving
//! either from the local data plane or from a remote peer controller. The
//! routing decision is made purely from the packet's own source/destination
//! addresses, not from which socket it arrived on:
//!
//! - source is our own virtual address: the packet originated locally and
//!   needs tunneling out. There is no specification for picking *which*
//!   controller to hand it to when the destination itself isn't resolved
//!   yet, so (matching the upstream behavior this was distilled from) it
//!   goes to the first controller in the routing index — a provisional
//!   policy, not a considered one.
//! - destination is our own virtual address: hand it down to the local data
//!   plane.
//! - destination is a known peer's virtual address: tunnel it to that
//!   peer's controller.
//! - otherwise: drop.
//!
//! IPv4 header layout puts the source address at bytes 12..16 and the
//! destination at bytes 16..20 within the IP header; the data plane prepends
//! a fixed 54-byte tunnel header before it, so those fields sit at offsets
//! 66..70 and 70..74. IPv6 puts source at header bytes 8..24 and destination
//! at 24..40, i.e. offsets 62..78 and 78..94. The IP version is the top
//! nibble of the first header byte (offset 54). A datagram too short to
//! carry a full header of the version it claims is dropped without
//! inspection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use crate::config::CONTROLLER_PORT;
use crate::controller::Stats;
use crate::state::State;

const IP_HEADER_OFFSET: usize = 54;
const IPV4_SRC_OFFSET: usize = IP_HEADER_OFFSET + 12;
const IPV4_DST_OFFSET: usize = IP_HEADER_OFFSET + 16;
const IPV4_MIN_LEN: usize = IP_HEADER_OFFSET + 20;
const IPV6_SRC_OFFSET: usize = IP_HEADER_OFFSET + 8;
const IPV6_DST_OFFSET: usize = IP_HEADER_OFFSET + 24;
const IPV6_MIN_LEN: usize = IP_HEADER_OFFSET + 40;

fn header_addrs(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
    if packet.len() <= IP_HEADER_OFFSET {
        return None;
    }
    match packet[IP_HEADER_OFFSET] >> 4 {
        4 => {
            if packet.len() < IPV4_MIN_LEN {
                return None;
            }
            let src = Ipv4Addr::new(
                packet[IPV4_SRC_OFFSET],
                packet[IPV4_SRC_OFFSET + 1],
                packet[IPV4_SRC_OFFSET + 2],
                packet[IPV4_SRC_OFFSET + 3],
            );
            let dst = Ipv4Addr::new(
                packet[IPV4_DST_OFFSET],
                packet[IPV4_DST_OFFSET + 1],
                packet[IPV4_DST_OFFSET + 2],
                packet[IPV4_DST_OFFSET + 3],
            );
            Some((IpAddr::V4(src), IpAddr::V4(dst)))
        }
        6 => {
            if packet.len() < IPV6_MIN_LEN {
                return None;
            }
            let mut src_bytes = [0u8; 16];
            let mut dst_bytes = [0u8; 16];
            src_bytes.copy_from_slice(&packet[IPV6_SRC_OFFSET..IPV6_SRC_OFFSET + 16]);
            dst_bytes.copy_from_slice(&packet[IPV6_DST_OFFSET..IPV6_DST_OFFSET + 16]);
            Some((IpAddr::V6(Ipv6Addr::from(src_bytes)), IpAddr::V6(Ipv6Addr::from(dst_bytes))))
        }
        _ => None,
    }
}

/// Forwards or locally delivers one encapsulated packet.
pub fn forward(socket: &UdpSocket, rpc_dest: SocketAddr, stats: &mut Stats, state: &State, packet: &[u8]) {
    let (src, dst) = match header_addrs(packet) {
        Some(addrs) => addrs,
        None => {
            tracing::debug!("dropping packet with unrecognized or truncated IP header ({} bytes)", packet.len());
            return;
        }
    };

    let self_ip4: Option<Ipv4Addr> = state.self_ip4().parse().ok();
    let self_ip6: Option<Ipv6Addr> = state.self_ip6().parse().ok();
    let is_self = |addr: IpAddr| match addr {
        IpAddr::V4(a) => self_ip4 == Some(a),
        IpAddr::V6(a) => self_ip6 == Some(a),
    };

    if is_self(src) {
        match state.routing.first_controller() {
            Some(controller_ip6) => {
                let controller_ip6 = controller_ip6.to_string();
                warm_route(socket, stats, &controller_ip6, dst);
                forward_to_controller(socket, stats, &controller_ip6, packet);
            }
            None => tracing::debug!("no known controller to tunnel locally-originated packet through"),
        }
        return;
    }

    if is_self(dst) {
        deliver_to_data_plane(socket, rpc_dest, stats, packet);
        return;
    }

    let controller_ip6 = match dst {
        IpAddr::V4(a) => state.routing.by_ip4.get(&a).cloned(),
        IpAddr::V6(a) => state.routing.by_ip6.get(&a.to_string()).cloned(),
    };
    match controller_ip6 {
        Some(controller_ip6) => {
            warm_route(socket, stats, &controller_ip6, dst);
            forward_to_controller(socket, stats, &controller_ip6, packet);
        }
        None => tracing::debug!("no route to virtual address {}, dropping", dst),
    }
}

fn warm_route(socket: &UdpSocket, stats: &mut Stats, controller_ip6: &str, dst: IpAddr) {
    let (ip4, ip6) = match dst {
        IpAddr::V4(a) => (Some(a.to_string()), None),
        IpAddr::V6(a) => (None, Some(a.to_string())),
    };
    crate::lookup::send_lookup_query_for(socket, stats, controller_ip6, ip4.as_deref(), ip6.as_deref());
}

fn forward_to_controller(socket: &UdpSocket, stats: &mut Stats, controller_ip6: &str, packet: &[u8]) {
    let dest = format!("[{}]:{}", controller_ip6, CONTROLLER_PORT);
    match dest.parse::<SocketAddr>() {
        Ok(addr) => match socket.send_to(packet, addr) {
            Ok(_) => stats.rpc_sent += 1,
            Err(e) => {
                stats.rpc_send_failures += 1;
                tracing::warn!("failed to forward packet to {}: {}", addr, e);
            }
        },
        Err(e) => tracing::warn!("bad controller address {}: {}", dest, e),
    }
}

fn deliver_to_data_plane(socket: &UdpSocket, rpc_dest: SocketAddr, stats: &mut Stats, packet: &[u8]) {
    match socket.send_to(packet, rpc_dest) {
        Ok(_) => stats.rpc_sent += 1,
        Err(e) => {
            stats.rpc_send_failures += 1;
            tracing::warn!("failed to deliver packet to data plane: {}", e);
        }
    }
}
