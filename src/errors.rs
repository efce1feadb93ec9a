//! Controller-level error taxonomy
//!
//! Distinct from per-datagram parsing failures (which are logged and dropped
//! inline by the classifier), this enum covers the handful of conditions the
//! event loop itself needs to reason about: a malformed inbound message that
//! made it past JSON parsing but not classification, and the fatal
//! configuration failures that should abort the process rather than retry on
//! the next tick.

use std::fmt;
use std::fmt::Display;

/// Controller-level errors
///
/// Mirrors the three policy buckets from the error handling design: transient
/// I/O is handled at the call site (log and continue) and never reaches this
/// type; `MalformedMessage` covers protocol ambiguity (drop silently);
/// `FatalConfig` covers conditions that leave the controller unable to make
/// progress at all.
#[derive(Debug)]
pub enum ControllerError {
    /// A JSON object was well-formed but did not match any known message
    /// shape, or referenced a field the classifier requires but does not
    /// find (e.g. `lookup` without `ip4` or `ip6`).
    MalformedMessage(String),

    /// A condition that leaves the controller unable to continue: no
    /// available virtual IPv4 slot in social mode, or the address coder
    /// failing to produce a UID at all.
    FatalConfig(String),
}

impl std::error::Error for ControllerError {}

impl Display for ControllerError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ControllerError::MalformedMessage(reason) => {
                write!(fmt, "malformed message: {}", reason)
            }
            ControllerError::FatalConfig(reason) => {
                write!(fmt, "fatal configuration error: {}", reason)
            }
        }
    }
}
