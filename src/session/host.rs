use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::session::control_messages::ControlMessage;
use crate::session::launch_args::connect_lobby_arg;
use crate::session::session_events::SessionEvent;
use crate::session::{NegotiationState, SessionContext};
use crate::substrate::peer_identity::{GroupId, PeerIdentity};
use crate::transport::connection::ConnectionRole;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HostState {
    Idle,
    ServerStarting,
    ServerReady,
}

/// The host side of session negotiation. The host owns the directory group; it accepts session
///  requests from group members, and a connection becomes usable once the remote peer sends its
///  readiness message.
///
/// The host's own client is a loopback connection that exists from the start, so application
///  code can address the host like any other peer.
#[derive(Debug)]
pub struct HostNegotiator {
    state: HostState,
    group: GroupId,
    /// accepted peers whose readiness is pending, with the time they were accepted
    awaiting_readiness: FxHashMap<PeerIdentity, Instant>,
    invite_when_ready: bool,
}

impl HostNegotiator {
    pub(crate) fn start(ctx: &mut SessionContext, group: GroupId, invite_when_ready: bool) -> HostNegotiator {
        info!("hosting {:?}", group);

        let myself = ctx.myself;
        let create = ctx.connection_factory(myself, ConnectionRole::ClientLocal);
        ctx.registry.get_or_register(myself, create);
        ctx.registry.set_self(myself);
        ctx.registry.set_primary(myself);

        ctx.events.send_event(SessionEvent::HostStarted { group });

        HostNegotiator {
            state: HostState::ServerStarting,
            group,
            awaiting_readiness: Default::default(),
            invite_when_ready,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn is_ready(&self) -> bool {
        self.state == HostState::ServerReady
    }

    /// The negotiation state of a remote peer from the host's perspective, `None` if the peer is
    ///  unknown
    pub(crate) fn negotiation_state(&self, ctx: &SessionContext, peer: PeerIdentity) -> Option<NegotiationState> {
        if self.awaiting_readiness.contains_key(&peer) {
            return Some(NegotiationState::AwaitingHandshakeAck);
        }
        ctx.registry.lookup(peer)
            .filter(|c| c.is_connected())
            .map(|_| NegotiationState::Established)
    }

    /// Remembers to invite peers as soon as the server is ready
    pub(crate) fn invite_when_ready(&mut self) {
        self.invite_when_ready = true;
    }

    pub(crate) fn on_tick(&mut self, ctx: &mut SessionContext, now: Instant) {
        if self.state == HostState::ServerStarting {
            self.bring_up_server(ctx);
        }
        self.check_readiness_timeouts(ctx, now);
    }

    fn bring_up_server(&mut self, ctx: &mut SessionContext) {
        let myself = ctx.myself;
        let Some(loopback) = ctx.registry.lookup_mut(myself) else {
            warn!("loopback connection is missing - re-registering it");
            let create = ctx.connection_factory(myself, ConnectionRole::ClientLocal);
            ctx.registry.get_or_register(myself, create);
            return;
        };
        loopback.mark_connected();

        self.state = HostState::ServerReady;
        info!("server for {:?} is ready", self.group);
        ctx.events.send_event(SessionEvent::ServerReady { group: self.group });
        ctx.events.send_event(SessionEvent::PeerReady { peer: myself });

        if self.invite_when_ready || ctx.config.invite_on_start {
            self.invite_when_ready = false;
            invite(ctx, self.group);
        }
    }

    fn check_readiness_timeouts(&mut self, ctx: &mut SessionContext, now: Instant) {
        let timeout = ctx.config.readiness_timeout;
        let timed_out = self.awaiting_readiness.iter()
            .map(|(&peer, &since)| (peer, now.saturating_duration_since(since)))
            .filter(|(_, elapsed)| *elapsed >= timeout)
            .collect::<Vec<_>>();

        for (peer, elapsed) in timed_out {
            warn!("{:?} did not send its readiness within {:?} - dropping the connection", peer, elapsed);
            self.awaiting_readiness.remove(&peer);
            ctx.registry.remove(peer);
            ctx.packet_channel.close_session(peer);
            ctx.events.send_event(SessionEvent::PeerNegotiationFailed {
                peer,
                reason: SessionError::NegotiationTimeout { peer, elapsed },
            });
        }
    }

    /// A remote peer asks to open a session. Only members of the group are accepted.
    pub(crate) fn on_session_request(&mut self, ctx: &mut SessionContext, peer: PeerIdentity, now: Instant) {
        if peer == ctx.myself {
            debug!("ignoring session request from myself");
            return;
        }

        if !ctx.directory.current_members(self.group).contains(&peer) {
            warn!("rejecting session request from {:?}: not a member of {:?}", peer, self.group);
            ctx.packet_channel.close_session(peer);
            ctx.events.send_event(SessionEvent::PeerRejected {
                peer,
                reason: SessionError::UnauthorizedPeer(peer),
            });
            return;
        }

        self.accept(ctx, peer, now);
    }

    /// Accepts a peer's session. This is idempotent: a repeated request from a registered peer
    ///  is answered with another acknowledgement, but it does not create a second connection.
    fn accept(&mut self, ctx: &mut SessionContext, peer: PeerIdentity, now: Instant) {
        if !ctx.packet_channel.accept_session(peer) {
            warn!("substrate refused to accept the session with {:?}", peer);
            return;
        }

        // the zero-length acknowledgement is the only signal the peer gets that we accepted
        if let Err(e) = ctx.packet_channel.send_reliable(peer, &[], ctx.config.control_channel) {
            warn!("acknowledging the session with {:?} failed: {}", peer, e);
            ctx.packet_channel.close_session(peer);
            ctx.events.send_event(SessionEvent::PeerNegotiationFailed {
                peer,
                reason: SessionError::SendFailed {
                    peer,
                    channel: ctx.config.control_channel,
                    reason: e.to_string(),
                },
            });
            return;
        }

        let create = ctx.connection_factory(peer, ConnectionRole::ClientRemote);
        let (_, created) = ctx.registry.get_or_register(peer, create);
        if created {
            info!("accepted session with {:?}, awaiting its readiness", peer);
            self.awaiting_readiness.insert(peer, now);
            ctx.events.send_event(SessionEvent::PeerAccepted { peer });
        }
        else {
            debug!("repeated session request from {:?} - acknowledged again", peer);
        }
    }

    pub(crate) fn on_control_message(&mut self, ctx: &mut SessionContext, from: PeerIdentity, msg: ControlMessage) {
        match msg {
            ControlMessage::Ready(identity) => {
                if identity != from {
                    warn!("readiness from {:?} carries identity {:?} - ignoring", from, identity);
                    return;
                }
                let Some(connection) = ctx.registry.lookup_mut(from) else {
                    debug!("readiness from unregistered {:?} - ignoring", from);
                    return;
                };

                self.awaiting_readiness.remove(&from);
                if connection.is_connected() {
                    debug!("repeated readiness from {:?}", from);
                    return;
                }
                connection.mark_connected();
                info!("{:?} is ready", from);
                ctx.events.send_event(SessionEvent::PeerReady { peer: from });
            }
            ControlMessage::SpawnRequest(identity) => {
                if ctx.registry.contains(identity) {
                    ctx.events.send_event(SessionEvent::SpawnRequested { peer: identity });
                }
                else {
                    debug!("spawn request from {:?} for unregistered {:?} - ignoring", from, identity);
                }
            }
            ControlMessage::Disconnect => {
                info!("{:?} disconnected", from);
                self.remove_peer(ctx, from);
            }
        }
    }

    pub(crate) fn on_member_left(&mut self, ctx: &mut SessionContext, peer: PeerIdentity) {
        if peer == ctx.myself {
            return;
        }
        debug!("{:?} left {:?}", peer, self.group);
        self.remove_peer(ctx, peer);
    }

    fn remove_peer(&mut self, ctx: &mut SessionContext, peer: PeerIdentity) {
        self.awaiting_readiness.remove(&peer);
        if ctx.registry.remove(peer).is_some() {
            ctx.packet_channel.close_session(peer);
            ctx.events.send_event(SessionEvent::PeerDisconnected { peer });
        }
    }

    /// Packets arrived from peers without a registered connection. For members of the group, the
    ///  stale substrate session is reset and the accept handshake runs again.
    pub(crate) fn recover_orphans(&mut self, ctx: &mut SessionContext, orphaned: &[PeerIdentity], now: Instant) {
        if orphaned.is_empty() {
            return;
        }

        let members = ctx.directory.current_members(self.group);
        for &peer in orphaned {
            if ctx.registry.contains(peer) {
                continue;
            }

            ctx.packet_channel.close_session(peer);
            if members.contains(&peer) {
                info!("re-running the accept handshake for orphaned {:?}", peer);
                self.accept(ctx, peer, now);
            }
            else {
                debug!("closed the session with orphaned non-member {:?}", peer);
            }
        }
    }
}

/// Invites the configured peer into the group, or lets the local user pick peers through the
///  directory's invite dialog
pub(crate) fn invite(ctx: &SessionContext, group: GroupId) {
    match ctx.config.auto_invite {
        Some(peer) => {
            let connect_string = connect_lobby_arg(group);
            if ctx.directory.invite(group, peer, &connect_string) {
                info!("invited {:?} to {:?}", peer, group);
            }
            else {
                warn!("inviting {:?} to {:?} failed", peer, group);
            }
        }
        None => ctx.directory.open_invite_dialog(group),
    }
}
