//! An in-process substrate implementing both [PacketChannel] and [PeerDirectory]. Peers sharing a
//!  [MemoryNetwork] can create and join groups and exchange packets, with the session
//!  request / accept semantics of typical peer-to-peer relay services:
//!
//! * Sending to a peer that has not accepted a session with the sender buffers the packet at the
//!    receiver and raises a session request there. Accepting releases the buffered packets.
//! * Sending to a peer implicitly opens the sender's side, so replies are delivered right away.
//! * A group's owner migrates to the longest-standing member when the owner leaves.
//!
//! Delivery is immediate and in order, unreliable sends included - the point of this substrate
//!  is deterministic scenarios, not loss simulation. Peers can be marked unreachable to make
//!  sends fail.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::substrate::{DirectoryEvent, PacketChannel, PeerDirectory};
use crate::substrate::peer_identity::{GroupId, PeerIdentity};

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    peers: FxHashMap<PeerIdentity, PeerState>,
    groups: FxHashMap<GroupId, GroupState>,
}

#[derive(Default)]
struct PeerState {
    reachable: bool,
    inbound: FxHashMap<u8, VecDeque<(PeerIdentity, Bytes)>>,
    /// packets from peers whose session was not (yet) accepted
    pending: FxHashMap<PeerIdentity, Vec<(u8, Bytes)>>,
    accepted: FxHashSet<PeerIdentity>,
    session_requests: VecDeque<PeerIdentity>,
    directory_events: VecDeque<DirectoryEvent>,
    invites: Vec<(GroupId, String)>,
    num_sent: usize,
}

struct GroupState {
    capacity: usize,
    /// in order of joining, the owner being the first
    members: Vec<PeerIdentity>,
    owner: PeerIdentity,
}

impl MemoryNetwork {
    pub fn new() -> MemoryNetwork {
        Default::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a peer to the network, returning its endpoint. The endpoint serves both as the
    ///  peer's [PacketChannel] and its [PeerDirectory].
    pub fn endpoint(&self, identity: PeerIdentity) -> Arc<MemoryEndpoint> {
        self.state().peers
            .entry(identity)
            .or_insert_with(|| PeerState {
                reachable: true,
                ..Default::default()
            });

        Arc::new(MemoryEndpoint {
            network: self.clone(),
            myself: identity,
        })
    }

    /// An unreachable peer can neither send nor receive packets
    pub fn set_reachable(&self, peer: PeerIdentity, reachable: bool) {
        if let Some(p) = self.state().peers.get_mut(&peer) {
            p.reachable = reachable;
        }
    }

    /// Simulates the user accepting an invitation through the directory's UI
    pub fn accept_invite(&self, peer: PeerIdentity, group: GroupId) {
        if let Some(p) = self.state().peers.get_mut(&peer) {
            p.invites.retain(|(g, _)| *g != group);
            p.directory_events.push_back(DirectoryEvent::JoinRequested { group });
        }
    }

    pub fn pending_invites(&self, peer: PeerIdentity) -> Vec<(GroupId, String)> {
        self.state().peers.get(&peer)
            .map(|p| p.invites.clone())
            .unwrap_or_default()
    }

    /// number of packets (including zero-length control packets) sent by a peer so far
    pub fn num_sent(&self, peer: PeerIdentity) -> usize {
        self.state().peers.get(&peer)
            .map(|p| p.num_sent)
            .unwrap_or(0)
    }

    pub fn group_members(&self, group: GroupId) -> Vec<PeerIdentity> {
        self.state().groups.get(&group)
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }
}

impl NetworkState {
    fn send(&mut self, from: PeerIdentity, to: PeerIdentity, buf: &[u8], channel: u8) -> anyhow::Result<()> {
        let sender_reachable = self.peers.get(&from).map(|p| p.reachable).unwrap_or(false);
        if !sender_reachable {
            return Err(anyhow!("{:?} is not connected to the network", from));
        }

        let receiver = match self.peers.get_mut(&to) {
            Some(p) if p.reachable => p,
            _ => return Err(anyhow!("{:?} is unreachable", to)),
        };

        let buf = Bytes::copy_from_slice(buf);
        if receiver.accepted.contains(&from) {
            receiver.inbound.entry(channel).or_default()
                .push_back((from, buf));
        }
        else {
            let pending = receiver.pending.entry(from).or_default();
            if pending.is_empty() {
                trace!("raising session request from {:?} at {:?}", from, to);
                receiver.session_requests.push_back(from);
            }
            pending.push((channel, buf));
        }

        if let Some(sender) = self.peers.get_mut(&from) {
            sender.accepted.insert(to);
            sender.num_sent += 1;
        }
        Ok(())
    }

    fn push_directory_event(&mut self, peer: PeerIdentity, event: DirectoryEvent) {
        if let Some(p) = self.peers.get_mut(&peer) {
            p.directory_events.push_back(event);
        }
    }

    fn leave_group(&mut self, peer: PeerIdentity, group_id: GroupId) {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return;
        };
        if !group.members.contains(&peer) {
            return;
        }

        group.members.retain(|m| *m != peer);
        let remaining = group.members.clone();

        if remaining.is_empty() {
            debug!("last member left {:?} - removing the group", group_id);
            self.groups.remove(&group_id);
            return;
        }
        if group.owner == peer {
            group.owner = remaining[0];
            debug!("owner of {:?} left, ownership migrates to {:?}", group_id, group.owner);
        }

        for member in remaining {
            self.push_directory_event(member, DirectoryEvent::MemberLeft { group: group_id, peer });
        }
    }
}

/// A single peer's view of a [MemoryNetwork]
pub struct MemoryEndpoint {
    network: MemoryNetwork,
    myself: PeerIdentity,
}

impl MemoryEndpoint {
    pub fn identity(&self) -> PeerIdentity {
        self.myself
    }

    fn with_peer<T>(&self, f: impl FnOnce(&mut PeerState) -> T) -> Option<T> {
        self.network.state().peers
            .get_mut(&self.myself)
            .map(f)
    }
}

impl PacketChannel for MemoryEndpoint {
    fn request_session(&self, peer: PeerIdentity) -> anyhow::Result<()> {
        self.send_reliable(peer, &[], 0)
    }

    fn accept_session(&self, peer: PeerIdentity) -> bool {
        self.with_peer(|p| {
            p.accepted.insert(peer);
            p.session_requests.retain(|r| *r != peer);
            for (channel, buf) in p.pending.remove(&peer).unwrap_or_default() {
                p.inbound.entry(channel).or_default()
                    .push_back((peer, buf));
            }
        }).is_some()
    }

    fn close_session(&self, peer: PeerIdentity) {
        self.with_peer(|p| {
            p.accepted.remove(&peer);
            p.pending.remove(&peer);
            p.session_requests.retain(|r| *r != peer);
        });
    }

    fn send_reliable(&self, peer: PeerIdentity, buf: &[u8], channel: u8) -> anyhow::Result<()> {
        self.network.state().send(self.myself, peer, buf, channel)
    }

    fn send_unreliable(&self, peer: PeerIdentity, buf: &[u8], channel: u8) -> anyhow::Result<()> {
        self.network.state().send(self.myself, peer, buf, channel)
    }

    fn poll_incoming(&self, channel: u8) -> Option<(PeerIdentity, Bytes)> {
        self.with_peer(|p| {
            if !p.reachable {
                return None;
            }
            p.inbound.get_mut(&channel)
                .and_then(|q| q.pop_front())
        }).flatten()
    }

    fn session_is_active(&self, peer: PeerIdentity) -> bool {
        self.with_peer(|p| p.accepted.contains(&peer))
            .unwrap_or(false)
    }

    fn poll_session_request(&self) -> Option<PeerIdentity> {
        self.with_peer(|p| p.session_requests.pop_front())
            .flatten()
    }
}

impl PeerDirectory for MemoryEndpoint {
    fn local_identity(&self) -> PeerIdentity {
        self.myself
    }

    fn create_group(&self, capacity: usize) -> anyhow::Result<GroupId> {
        if capacity == 0 {
            return Err(anyhow!("a group needs room for at least its owner"));
        }

        let mut state = self.network.state();
        let mut group = GroupId(rand::random());
        while state.groups.contains_key(&group) {
            group = GroupId(rand::random());
        }

        state.groups.insert(group, GroupState {
            capacity,
            members: vec![self.myself],
            owner: self.myself,
        });
        state.push_directory_event(self.myself, DirectoryEvent::GroupEntered { group });
        Ok(group)
    }

    fn join_group(&self, group_id: GroupId) -> anyhow::Result<()> {
        let mut state = self.network.state();

        let joined = match state.groups.get_mut(&group_id) {
            Some(group) if group.members.contains(&self.myself) => true,
            Some(group) if group.members.len() < group.capacity => {
                group.members.push(self.myself);
                true
            }
            _ => false,
        };

        if !joined {
            state.push_directory_event(self.myself, DirectoryEvent::GroupEnterFailed { group: group_id });
            return Ok(());
        }

        let others = state.groups.get(&group_id)
            .map(|g| g.members.iter().copied().filter(|&m| m != self.myself).collect::<Vec<_>>())
            .unwrap_or_default();
        for member in others {
            state.push_directory_event(member, DirectoryEvent::MemberJoined { group: group_id, peer: self.myself });
        }
        state.push_directory_event(self.myself, DirectoryEvent::GroupEntered { group: group_id });
        Ok(())
    }

    fn leave_group(&self, group: GroupId) {
        self.network.state().leave_group(self.myself, group);
    }

    fn current_members(&self, group: GroupId) -> Vec<PeerIdentity> {
        self.network.group_members(group)
    }

    fn owner_of(&self, group: GroupId) -> Option<PeerIdentity> {
        self.network.state().groups.get(&group)
            .map(|g| g.owner)
    }

    fn invite(&self, group: GroupId, peer: PeerIdentity, connect_string: &str) -> bool {
        let mut state = self.network.state();
        match state.peers.get_mut(&peer) {
            Some(p) => {
                p.invites.push((group, connect_string.to_string()));
                true
            }
            None => false,
        }
    }

    fn open_invite_dialog(&self, group: GroupId) {
        debug!("{:?} opens the invite dialog for {:?}", self.myself, group);
    }

    fn poll_event(&self) -> Option<DirectoryEvent> {
        self.with_peer(|p| p.directory_events.pop_front())
            .flatten()
    }
}
