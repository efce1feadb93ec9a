//! Notification Router
//!
//! Decides what a `Discovery`/`ConnectionRequest`/`Ip4Update` datagram
//! *means* based on where it came from, before handing it on:
//!
//! - `Discovery` (bare fingerprint): always names a specific peer to connect
//!   to. Feed it straight to the Orchestrator; only `nid` depends on whether
//!   it arrived over loopback or from a remote controller.
//! - `ConnectionRequest` from the data plane (loopback), carrying a
//!   fingerprint that isn't ours: the social layer delivered an invitation to
//!   connect to `uid` directly. Feed it straight to the Orchestrator.
//! - `ConnectionRequest` from the data plane, carrying our own fingerprint:
//!   this is our own request to reach every known peer. Broadcast a copy to
//!   each online peer's controller, carrying our own uid/fpr so the
//!   recipient can call back directly.
//! - `ConnectionRequest` from a remote controller, addressed to us
//!   (`uid == self_uid`): we are the destination; `from` names who invited
//!   us. Feed it to the Orchestrator.
//! - `ConnectionRequest` from a remote controller, addressed to a third
//!   peer: a relay hop. Forward the notification unchanged to the named
//!   peer's controller, looked up by UID in the routing index; drop it if
//!   that peer isn't online or has no known route (the relay chain has
//!   nowhere left to go).

use std::net::{SocketAddr, UdpSocket};

use serde_json::json;

use crate::config::CONTROLLER_PORT;
use crate::controller::Stats;
use crate::errors::ControllerError;
use crate::message::InboundMessage;
use crate::orchestrator::Orchestrator;
use crate::rpc::RpcClient;
use crate::state::State;

#[allow(clippy::too_many_arguments)]
pub fn route(
    socket: &UdpSocket,
    rpc: &RpcClient,
    orchestrator: &Orchestrator,
    stats: &mut Stats,
    state: &mut State,
    src: SocketAddr,
    is_loopback: bool,
    msg: InboundMessage,
) -> Result<(), ControllerError> {
    match msg {
        InboundMessage::Discovery { uid, fpr, ip4 } => {
            // A bare-fingerprint notification names a specific peer to
            // connect to, regardless of whether it arrived over loopback or
            // from a remote controller; only `nid` (how to tell the data
            // plane the request arrived) depends on the source. Unlike
            // `ConnectionRequest`, there is no own-fingerprint broadcast
            // variant here — that's the classifier routing an own-fpr
            // notification as a `ConnectionRequest` instead.
            let nid = if is_loopback { 1 } else { 0 };
            orchestrator.create_connection(socket, rpc, stats, state, &uid, &fpr, nid, "", ip4.as_deref(), true)?;
        }
        InboundMessage::ConnectionRequest { uid, fpr, cas, ip4, from } => {
            if is_loopback {
                // The social layer encodes its own fpr when it wants us to
                // broadcast our presence to everyone; any other fpr is an
                // invitation to connect to `uid` directly.
                if fpr != state.self_fpr() {
                    if uid != state.self_uid() {
                        orchestrator.create_connection(socket, rpc, stats, state, &uid, &fpr, 1, &cas, ip4.as_deref(), true)?;
                    }
                } else {
                    broadcast(socket, stats, state, &uid, &fpr, &cas, ip4.as_deref());
                }
            } else if uid == state.self_uid() {
                // We are the addressed destination; `from` names who invited us.
                if let Some(from_uid) = from {
                    if from_uid != uid {
                        orchestrator.create_connection(
                            socket,
                            rpc,
                            stats,
                            state,
                            &from_uid,
                            &fpr,
                            0,
                            &cas,
                            ip4.as_deref(),
                            true,
                        )?;
                    }
                }
            } else {
                // `uid` names a third peer; relay the notification unchanged.
                forward(socket, stats, state, &uid, &fpr, &cas, ip4.as_deref(), from.as_deref());
            }
        }
        InboundMessage::Ip4Update { uid, ip4 } => {
            orchestrator.update_remote_ip4(socket, rpc, stats, &uid, &ip4);
        }
        other => {
            tracing::debug!("router received a non-notification message, ignoring: {:?}", other);
        }
    }
    Ok(())
}

fn notification_payload(self_uid: &str, fpr: &str, cas: &str, ip4: Option<&str>) -> serde_json::Value {
    let data = if cas.is_empty() {
        fpr.to_string()
    } else {
        format!("{}|{}", fpr, cas)
    };
    let mut value = json!({"uid": self_uid, "data": data});
    if let Some(ip4) = ip4 {
        value["ip4"] = json!(ip4);
    }
    value
}

fn send_notification(socket: &UdpSocket, stats: &mut Stats, dest_ip6: &str, value: &serde_json::Value) {
    let bytes = match serde_json::to_vec(value) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("failed to encode notification: {}", e);
            return;
        }
    };
    let dest = format!("[{}]:{}", dest_ip6, CONTROLLER_PORT);
    match dest.parse::<SocketAddr>() {
        Ok(addr) => match socket.send_to(&bytes, addr) {
            Ok(_) => stats.rpc_sent += 1,
            Err(e) => {
                stats.rpc_send_failures += 1;
                tracing::warn!("failed to send notification to {}: {}", addr, e);
            }
        },
        Err(e) => tracing::warn!("bad controller address {}: {}", dest, e),
    }
}

/// Floods a loopback-originated "broadcast our presence" request to every
/// online peer. `uid` is the flood target carried on the original request
/// and passes through unchanged; `from` names us, so the recipient knows who
/// to call back, matching `vpn_controller.py`'s `route_notification` which
/// keeps the request's own `uid` field and adds its own address as `from`
/// rather than overwriting `uid` with the local identity.
pub(crate) fn broadcast(socket: &UdpSocket, stats: &mut Stats, state: &State, uid: &str, fpr: &str, cas: &str, ip4: Option<&str>) {
    let self_uid = state.self_uid().to_string();
    let mut value = notification_payload(uid, fpr, cas, ip4);
    value["from"] = json!(self_uid);
    for peer in state.online_peers() {
        if peer.ip6.is_empty() {
            continue;
        }
        send_notification(socket, stats, &peer.ip6, &value);
    }
}

/// Relays a connection-request notification addressed to a third peer,
/// named by `uid`, unchanged except for the `from` field it already carries.
/// Drops silently if that peer isn't online — there is nowhere left to send
/// it and no originator to report the failure to.
fn forward(
    socket: &UdpSocket,
    stats: &mut Stats,
    state: &State,
    uid: &str,
    fpr: &str,
    cas: &str,
    ip4: Option<&str>,
    from: Option<&str>,
) {
    let online = state.peer(uid).is_some_and(|p| p.status == crate::state::PeerStatus::Online);
    if !online {
        tracing::debug!("relay target {} is not online, dropping", uid);
        return;
    }
    let dest = match state.routing.controller_for_uid(uid) {
        Some(dest) => dest.to_string(),
        None => {
            tracing::debug!("no route to relay target {}, dropping", uid);
            return;
        }
    };
    let mut value = notification_payload(uid, fpr, cas, ip4);
    if let Some(from_uid) = from {
        value["from"] = json!(from_uid);
    }
    send_notification(socket, stats, &dest, &value);
}
