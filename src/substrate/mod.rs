//! The two external collaborators the session core is built on, specified only at their interface
//!  boundary: the [PeerDirectory] (lobby / matchmaking service) and the [PacketChannel]
//!  (point-to-point datagrams addressed by peer identity, with NAT traversal and relaying
//!  handled inside the substrate).
//!
//! Both are polled: events that a substrate would typically deliver through callbacks
//!  (membership changes, incoming session requests) are queued by the implementation and
//!  drained once per tick by the session. All methods take `&self` so that implementations can
//!  be shared between the session and its connections; they must never block.

pub mod peer_identity;
pub mod memory;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::substrate::peer_identity::{GroupId, PeerIdentity};

#[cfg_attr(test, automock)]
pub trait PacketChannel: Send + Sync + 'static {
    /// Ask `peer` to open a point-to-point session with us. This sends a zero-length packet,
    ///  which surfaces at the peer as a session request.
    fn request_session(&self, peer: PeerIdentity) -> anyhow::Result<()>;

    /// Accept a session requested by `peer`, releasing packets it sent before acceptance.
    fn accept_session(&self, peer: PeerIdentity) -> bool;

    fn close_session(&self, peer: PeerIdentity);

    fn send_reliable(&self, peer: PeerIdentity, buf: &[u8], channel: u8) -> anyhow::Result<()>;

    fn send_unreliable(&self, peer: PeerIdentity, buf: &[u8], channel: u8) -> anyhow::Result<()>;

    /// Returns the next available datagram on the given channel index, if any.
    fn poll_incoming(&self, channel: u8) -> Option<(PeerIdentity, Bytes)>;

    fn session_is_active(&self, peer: PeerIdentity) -> bool;

    /// Returns the next pending 'a peer asks to open a session' notification, if any.
    fn poll_session_request(&self) -> Option<PeerIdentity>;
}

/// Notifications from the peer directory, drained once per tick
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DirectoryEvent {
    /// the local peer entered a group, either by creating or by joining it
    GroupEntered { group: GroupId },
    GroupEnterFailed { group: GroupId },
    MemberJoined { group: GroupId, peer: PeerIdentity },
    MemberLeft { group: GroupId, peer: PeerIdentity },
    /// the local user accepted an invitation to a group while the process was running
    JoinRequested { group: GroupId },
}

#[cfg_attr(test, automock)]
pub trait PeerDirectory: Send + Sync + 'static {
    fn local_identity(&self) -> PeerIdentity;

    /// Creates a group owned by the local peer. Entering the group is confirmed asynchronously
    ///  by [DirectoryEvent::GroupEntered].
    fn create_group(&self, capacity: usize) -> anyhow::Result<GroupId>;

    /// Entering the group is confirmed asynchronously, see [DirectoryEvent].
    fn join_group(&self, group: GroupId) -> anyhow::Result<()>;

    fn leave_group(&self, group: GroupId);

    fn current_members(&self, group: GroupId) -> Vec<PeerIdentity>;

    fn owner_of(&self, group: GroupId) -> Option<PeerIdentity>;

    /// Invites a specific peer, passing the command line it should be launched with
    fn invite(&self, group: GroupId, peer: PeerIdentity, connect_string: &str) -> bool;

    /// Lets the local user pick peers to invite, e.g. through an overlay
    fn open_invite_dialog(&self, group: GroupId);

    fn poll_event(&self) -> Option<DirectoryEvent>;
}
