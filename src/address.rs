//! Address Coder: UID derivation and virtual IPv4/IPv6 assignment
//!
//! All three operations are pure functions of their inputs so they can be
//! property-tested without a socket in sight. The group-mode reverse lookup
//! (`gen_ip4_group`) is the one O(254) operation in the controller; it only
//! runs on peer discovery, not on the hot path.

use sha1::{Digest, Sha1};

use crate::config::UidSize;

/// Derives a UID by SHA-1 hashing `seed`, truncated to `size` hex chars.
pub fn gen_uid(seed: &str, size: UidSize) -> String {
    let mut hasher = Sha1::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let full = hex::encode(digest);
    full[..size.len()].to_string()
}

/// Generates a UID from random bytes, used when no stable seed (hostname or
/// configured IPv4) is available.
pub fn gen_uid_random(size: UidSize) -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 20];
    rand::rng().fill_bytes(&mut bytes);
    let full = hex::encode(bytes);
    full[..size.len()].to_string()
}

/// Appends the first 16 hex chars of `uid`, grouped 4x4, to `prefix`.
///
/// Serves both as local address assignment and as the forward-lookup
/// function for a remote peer's virtual IPv6: the same UID always maps to
/// the same address.
pub fn gen_ip6(uid: &str, prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 20);
    out.push_str(prefix);
    let padded: String = if uid.len() >= 16 {
        uid[..16].to_string()
    } else {
        format!("{:0<16}", uid)
    };
    for chunk in padded.as_bytes().chunks(4) {
        out.push(':');
        out.push_str(std::str::from_utf8(chunk).expect("hex chars are ascii"));
    }
    out
}

/// Replaces the last octet of `base` with `101 + peer_count`.
///
/// `peer_count` is the size of the peerlist *before* the new peer is added.
/// Returns `Err` once the /24 is exhausted (peer_count >= MAX_SOCIAL_PEERS),
/// which the caller must treat as a fatal configuration error.
pub fn gen_ip4_social(peer_count: usize, base: &str) -> Result<String, String> {
    if peer_count >= crate::config::MAX_SOCIAL_PEERS {
        return Err(format!(
            "social mode exhausted virtual IPv4 /24: {} peers already assigned",
            peer_count
        ));
    }
    let last_octet = 101 + peer_count;
    replace_last_octet(base, last_octet)
}

/// Scans the /24 containing `base` for the host octet `i` in `1..254` whose
/// `gen_uid` equals `uid`. Returns `None` if no match is found.
pub fn gen_ip4_group(uid: &str, base: &str, size: UidSize) -> Option<String> {
    let prefix = net24_prefix(base)?;
    for i in 1u32..254 {
        let candidate = format!("{}.{}", prefix, i);
        if gen_uid(&candidate, size) == uid {
            return Some(candidate);
        }
    }
    None
}

fn net24_prefix(ip4: &str) -> Option<String> {
    let parts: Vec<&str> = ip4.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    Some(format!("{}.{}.{}", parts[0], parts[1], parts[2]))
}

fn replace_last_octet(ip4: &str, octet: usize) -> Result<String, String> {
    let prefix = net24_prefix(ip4).ok_or_else(|| format!("not a dotted-quad IPv4 address: {}", ip4))?;
    Ok(format!("{}.{}", prefix, octet))
}
