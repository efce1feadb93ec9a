//! Message Classifier
//!
//! One datagram in, one `InboundMessage` (or a silent/logged drop) out. The
//! precedence table from the design is implemented top-down as a sequence of
//! early returns rather than a single match, because later rows depend on
//! fields (`fpr_len`) only known once a snapshot has been cached — see
//! `classify`'s doc comment for the exact order.

use serde_json::Value;

use crate::errors::ControllerError;
use crate::state::{PeerStatusUpdate, StateSnapshot};

/// The tagged union the classifier reduces every inbound datagram to.
///
/// Replaces the original's ad hoc `"_uid" in msg` / `len(data)` checks with a
/// single match at the call site.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    StateSnapshot(StateSnapshot),
    PeerStatus(PeerStatusUpdate),
    /// Bare-fingerprint notification: `|data| == |_fpr|`
    Discovery {
        uid: String,
        fpr: String,
        ip4: Option<String>,
    },
    /// `fpr || "|" || cas` notification: `|data| > |_fpr|`
    ConnectionRequest {
        uid: String,
        fpr: String,
        cas: String,
        ip4: Option<String>,
        from: Option<String>,
    },
    /// `data == "ip4:" + address`
    Ip4Update { uid: String, ip4: String },
    Lookup {
        ip4: Option<String>,
        ip6: Option<String>,
    },
    NcLookup {
        ip4: Option<String>,
        ip6: Option<String>,
    },
    Discover,
    /// First byte wasn't `{`: an encapsulated IP packet from the data plane
    /// or a peer controller, handed whole to the Packet Forwarder.
    RawPacket(Vec<u8>),
}

/// Classifies one received datagram.
///
/// `fpr_len` is the length of the locally cached `_fpr`, or `None` if no
/// snapshot with a non-empty `_fpr` has been received yet — in which case
/// every row past the snapshot/status checks is dropped, matching the
/// source's `if len(self.state["_fpr"]) == 0: continue`.
///
/// Returns `Ok(None)` for a datagram that classifies as a legitimate,
/// silent drop (protocol ambiguity); returns `Err` only when the bytes
/// themselves are unusable (not valid JSON, or a JSON value that isn't an
/// object) so the caller can log it as a transient I/O condition.
pub fn classify(buf: &[u8], fpr_len: Option<usize>) -> Result<Option<InboundMessage>, ControllerError> {
    match buf.first() {
        None => return Ok(None),
        Some(b'{') => {}
        Some(_) => return Ok(Some(InboundMessage::RawPacket(buf.to_vec()))),
    }

    let value: Value = serde_json::from_slice(buf)
        .map_err(|e| ControllerError::MalformedMessage(format!("invalid JSON: {}", e)))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ControllerError::MalformedMessage("JSON payload is not an object".to_string()))?;

    if obj.contains_key("_fpr") || obj.contains_key("_uid") {
        let snapshot: StateSnapshot = serde_json::from_value(value)
            .map_err(|e| ControllerError::MalformedMessage(format!("bad state snapshot: {}", e)))?;
        return Ok(Some(InboundMessage::StateSnapshot(snapshot)));
    }

    if obj.contains_key("uid") && obj.contains_key("status") {
        let update: PeerStatusUpdate = serde_json::from_value(value)
            .map_err(|e| ControllerError::MalformedMessage(format!("bad peer status: {}", e)))?;
        return Ok(Some(InboundMessage::PeerStatus(update)));
    }

    let fpr_len = match fpr_len {
        Some(len) => len,
        None => return Ok(None),
    };

    let as_str = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);

    match obj.get("m").and_then(Value::as_str) {
        Some("lookup") => {
            return Ok(Some(InboundMessage::Lookup {
                ip4: as_str("ip4"),
                ip6: as_str("ip6"),
            }));
        }
        Some("nc_lookup") => {
            return Ok(Some(InboundMessage::NcLookup {
                ip4: as_str("ip4"),
                ip6: as_str("ip6"),
            }));
        }
        Some("discover") => return Ok(Some(InboundMessage::Discover)),
        _ => {}
    }

    let data = match as_str("data") {
        Some(d) => d,
        None => return Ok(None),
    };
    let uid = match as_str("uid") {
        Some(u) => u,
        None => return Ok(None),
    };
    let ip4 = as_str("ip4");

    if data.len() == fpr_len {
        return Ok(Some(InboundMessage::Discovery { uid, fpr: data, ip4 }));
    }

    if data.len() > fpr_len {
        let fpr = data[..fpr_len].to_string();
        let cas = if data.len() > fpr_len + 1 {
            data[fpr_len + 1..].to_string()
        } else {
            String::new()
        };
        return Ok(Some(InboundMessage::ConnectionRequest {
            uid,
            fpr,
            cas,
            ip4,
            from: as_str("from"),
        }));
    }

    if let Some(rest) = data.strip_prefix("ip4:") {
        return Ok(Some(InboundMessage::Ip4Update {
            uid,
            ip4: rest.to_string(),
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_packet_when_first_byte_not_brace() {
        let buf = [0x45u8, 0x00, 0x00, 0x1c];
        let msg = classify(&buf, Some(4)).unwrap().unwrap();
        assert!(matches!(msg, InboundMessage::RawPacket(_)));
    }

    #[test]
    fn drops_before_state_received() {
        let buf = br#"{"uid":"peer1","data":"abcd"}"#;
        let msg = classify(buf, None).unwrap();
        assert!(msg.is_none());
    }

    #[test]
    fn state_snapshot_identified_by_fpr_key() {
        let buf = br#"{"_uid":"","_fpr":"","_ip4":"172.31.0.100","_ip6":"","peers":{}}"#;
        let msg = classify(buf, None).unwrap().unwrap();
        assert!(matches!(msg, InboundMessage::StateSnapshot(_)));
    }

    #[test]
    fn peer_status_update_identified_by_uid_and_status() {
        let buf = br#"{"uid":"peer1","status":"offline","last_time":61}"#;
        let msg = classify(buf, Some(4)).unwrap().unwrap();
        assert!(matches!(msg, InboundMessage::PeerStatus(_)));
    }

    #[test]
    fn discovery_when_data_len_equals_fpr_len() {
        let buf = br#"{"uid":"peer1","data":"abcd"}"#;
        let msg = classify(buf, Some(4)).unwrap().unwrap();
        match msg {
            InboundMessage::Discovery { uid, fpr, .. } => {
                assert_eq!(uid, "peer1");
                assert_eq!(fpr, "abcd");
            }
            other => panic!("expected Discovery, got {:?}", other),
        }
    }

    #[test]
    fn connection_request_splits_fpr_and_cas_on_separator() {
        let buf = br#"{"uid":"peer1","data":"abcd|some-candidate-lines"}"#;
        let msg = classify(buf, Some(4)).unwrap().unwrap();
        match msg {
            InboundMessage::ConnectionRequest { fpr, cas, .. } => {
                assert_eq!(fpr, "abcd");
                assert_eq!(cas, "some-candidate-lines");
            }
            other => panic!("expected ConnectionRequest, got {:?}", other),
        }
    }

    #[test]
    fn ip4_update_when_data_has_prefix() {
        let buf = br#"{"uid":"peer1","data":"ip4:10.1.0.9"}"#;
        let msg = classify(buf, Some(40)).unwrap().unwrap();
        match msg {
            InboundMessage::Ip4Update { ip4, .. } => assert_eq!(ip4, "10.1.0.9"),
            other => panic!("expected Ip4Update, got {:?}", other),
        }
    }

    #[test]
    fn lookup_message_carries_ip4_and_ip6() {
        let buf = br#"{"m":"lookup","ip4":"10.1.0.7","ip6":null}"#;
        let msg = classify(buf, Some(40)).unwrap().unwrap();
        match msg {
            InboundMessage::Lookup { ip4, ip6 } => {
                assert_eq!(ip4.as_deref(), Some("10.1.0.7"));
                assert_eq!(ip6, None);
            }
            other => panic!("expected Lookup, got {:?}", other),
        }
    }

    #[test]
    fn malformed_json_is_an_error_not_a_panic() {
        let buf = b"{not json";
        assert!(classify(buf, Some(40)).is_err());
    }
}
