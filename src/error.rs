use std::time::Duration;

use thiserror::Error;

use crate::substrate::peer_identity::PeerIdentity;

/// Errors of the session core. They are `Clone + Eq` so they can travel inside
///  [crate::session::session_events::SessionEvent]s: nothing in the core throws across a tick
///  boundary, failures are reported as state plus an event.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SessionError {
    /// a session request from an identity that is not a member of the directory group - the
    ///  request is rejected, the session keeps running
    #[error("session request from {0:?}, which is not a member of the group")]
    UnauthorizedPeer(PeerIdentity),

    #[error("there is already a live connection for {0:?}")]
    DuplicatePeer(PeerIdentity),

    /// the substrate rejected a send. This is reported to the caller and never retried silently.
    #[error("sending to {peer:?} on channel {channel} failed: {reason}")]
    SendFailed {
        peer: PeerIdentity,
        channel: u8,
        reason: String,
    },

    #[error("negotiation with {peer:?} timed out after {elapsed:?}")]
    NegotiationTimeout {
        peer: PeerIdentity,
        elapsed: Duration,
    },

    /// a malformed inbound buffer: the remainder of the packet is discarded, the connection stays
    ///  alive
    #[error("framing violation at offset {offset}: {reason}")]
    FramingViolation {
        offset: usize,
        reason: &'static str,
    },

    /// API misuse before negotiation completed
    #[error("session role is not established yet")]
    RoleNotEstablished,

    #[error("no connection registered for {0:?}")]
    UnknownPeer(PeerIdentity),

    #[error("connection to {0:?} is not ready for application traffic")]
    ConnectionNotReady(PeerIdentity),

    #[error("channel index {0} is not configured")]
    InvalidChannel(u8),

    #[error("message payload of {0} bytes does not fit into a frame or packet")]
    MessageTooLarge(usize),

    #[error("message type {0} is reserved for session control messages")]
    ReservedMessageType(i16),

    #[error("a handler is already registered for message type {0}")]
    DuplicateHandler(i16),

    #[error("substrate session with {0:?} is not active")]
    SessionInactive(PeerIdentity),

    #[error("host {0:?} left the group")]
    HostLeft(PeerIdentity),

    #[error("peer directory: {0}")]
    Directory(String),
}
