use tokio::sync::broadcast;
use tracing::trace;

use crate::error::SessionError;
use crate::session::LobbyState;
use crate::substrate::peer_identity::{GroupId, PeerIdentity};

/// Everything that happens in a session and is of interest to the application: state
///  transitions, peers coming and going, and failures. Nothing in the session core fails across a
///  tick boundary, failures are reported through these events instead.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    LobbyStateChanged { old: LobbyState, new: LobbyState },

    /// host path: the local peer owns the group, the loopback connection exists
    HostStarted { group: GroupId },
    /// host path: the loopback is live, remote peers can be accepted
    ServerReady { group: GroupId },
    /// a peer entered the directory group. This is independent of its connection state.
    MemberJoined { peer: PeerIdentity },
    /// host path: a peer's session request was accepted, readiness is pending
    PeerAccepted { peer: PeerIdentity },
    /// host path: a peer (or the host itself, through its loopback) is ready for application
    ///  traffic
    PeerReady { peer: PeerIdentity },
    /// host path: a peer asks to be represented in the shared world
    SpawnRequested { peer: PeerIdentity },
    PeerDisconnected { peer: PeerIdentity },
    /// host path: a session request was rejected, the session continues
    PeerRejected { peer: PeerIdentity, reason: SessionError },
    /// host path: an accepted peer did not complete the handshake
    PeerNegotiationFailed { peer: PeerIdentity, reason: SessionError },

    /// join path: the handshake with the host is complete
    ConnectedToHost { host: PeerIdentity },
    /// join path: terminal, there is no retry at this level
    ConnectionFailed { reason: SessionError },

    Disconnected,
}

pub struct SessionEventNotifier {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionEventNotifier {
    pub fn new() -> SessionEventNotifier {
        let (sender, _) = broadcast::channel(128);

        SessionEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: SessionEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
