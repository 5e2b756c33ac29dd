//! A [Session] turns "we are members of the same directory group" into working connections, and
//!  offers the channel-addressed send / receive API on top of them.
//!
//! The session is driven by calling [Session::tick] on a fixed cadence (see [driver]). Each tick
//!  drains the substrate's event queues, advances negotiation, dispatches inbound packets and
//!  flushes outbound batches - it never blocks, and nothing fails across a tick boundary:
//!  failures are reported as state plus a [session_events::SessionEvent].

pub mod control_messages;
pub mod driver;
pub mod host;
pub mod join;
pub mod launch_args;
pub mod session_config;
pub mod session_events;

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::session::control_messages::{ControlMessage, ControlMessageModule, ControlMessageType};
use crate::session::host::HostNegotiator;
use crate::session::join::{JoinNegotiator, JoinOutcome};
use crate::session::launch_args::connect_lobby_from_args;
use crate::session::session_config::SessionConfig;
use crate::session::session_events::{SessionEvent, SessionEventNotifier};
use crate::substrate::{DirectoryEvent, PacketChannel, PeerDirectory};
use crate::substrate::peer_identity::{GroupId, PeerIdentity};
use crate::transport::connection::{ConnectionId, ConnectionRole, LogicalConnection};
use crate::transport::dispatch_incoming;
use crate::transport::message_handler::{MessageHandler, MessageHandlers};
use crate::transport::registry::ConnectionRegistry;

/// Connection state of the local peer with regard to the directory group
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LobbyState {
    Undefined,
    Connecting,
    Cancelled,
    Connected,
    Failed,
    Disconnected,
}

/// Derived from group ownership when the directory confirms membership: the owner hosts
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionRole {
    Host,
    Joiner,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NegotiationState {
    AwaitingDirectoryMembership,
    AwaitingSubstrateAccept,
    AwaitingHandshakeAck,
    Established,
    Failed,
}

/// The parts of a session that negotiators work on
pub(crate) struct SessionContext {
    pub config: Arc<SessionConfig>,
    pub myself: PeerIdentity,
    pub packet_channel: Arc<dyn PacketChannel>,
    pub directory: Arc<dyn PeerDirectory>,
    pub registry: ConnectionRegistry,
    pub handlers: MessageHandlers,
    pub events: SessionEventNotifier,
}

impl SessionContext {
    pub fn new(config: Arc<SessionConfig>, packet_channel: Arc<dyn PacketChannel>, directory: Arc<dyn PeerDirectory>) -> SessionContext {
        let myself = directory.local_identity();
        SessionContext {
            config,
            myself,
            packet_channel,
            directory,
            registry: ConnectionRegistry::new(myself),
            handlers: MessageHandlers::new(),
            events: SessionEventNotifier::new(),
        }
    }

    /// Creates connections to `remote` with this session's configuration, for registration in
    ///  the [ConnectionRegistry]
    pub fn connection_factory(&self, remote: PeerIdentity, role: ConnectionRole) -> impl FnOnce(ConnectionId) -> LogicalConnection {
        let local = self.myself;
        let channel_spec = self.config.channel_spec.clone();
        let packet_channel = self.packet_channel.clone();
        let max_packet_size = self.config.max_packet_size;

        move |id| LogicalConnection::new(id, local, remote, role, channel_spec, packet_channel, max_packet_size)
    }
}

#[derive(Debug)]
enum Negotiator {
    Host(HostNegotiator),
    Join(JoinNegotiator),
}

pub struct Session {
    ctx: SessionContext,
    group: Option<GroupId>,
    lobby_state: LobbyState,
    negotiator: Option<Negotiator>,
    control_messages: mpsc::UnboundedReceiver<(PeerIdentity, ControlMessage)>,
    invite_when_ready: bool,
    last_failure: Option<SessionError>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session{{{:?} {:?} {:?} {:?}}}", self.ctx.myself, self.group, self.lobby_state, self.role())
    }
}

impl Session {
    pub fn new(config: Arc<SessionConfig>, packet_channel: Arc<dyn PacketChannel>, directory: Arc<dyn PeerDirectory>) -> anyhow::Result<Session> {
        config.validate()?;

        let mut ctx = SessionContext::new(config, packet_channel, directory);

        let (send, recv) = mpsc::unbounded_channel();
        let control_module = ControlMessageModule::new(send);
        for msg_type in [ControlMessageType::Disconnect, ControlMessageType::Ready, ControlMessageType::SpawnRequest] {
            ctx.handlers.register_control(msg_type.into(), control_module.clone())?;
        }

        Ok(Session {
            ctx,
            group: None,
            lobby_state: LobbyState::Undefined,
            negotiator: None,
            control_messages: recv,
            invite_when_ready: false,
            last_failure: None,
        })
    }

    pub fn myself(&self) -> PeerIdentity {
        self.ctx.myself
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn lobby_state(&self) -> LobbyState {
        self.lobby_state
    }

    /// `None` until the directory confirmed membership in a group
    pub fn role(&self) -> Option<SessionRole> {
        match &self.negotiator {
            Some(Negotiator::Host(_)) => Some(SessionRole::Host),
            Some(Negotiator::Join(join)) if join.host().is_some() => Some(SessionRole::Joiner),
            _ => None,
        }
    }

    /// The joiner's negotiation state, `None` on a host or outside a group
    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        match &self.negotiator {
            Some(Negotiator::Join(join)) => Some(join.state()),
            _ => None,
        }
    }

    pub fn is_server_ready(&self) -> bool {
        matches!(&self.negotiator, Some(Negotiator::Host(host)) if host.is_ready())
    }

    pub fn is_connected_to_server(&self) -> bool {
        self.ctx.registry.resolve_host()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// the most recent terminal failure, if any
    pub fn last_failure(&self) -> Option<&SessionError> {
        self.last_failure.as_ref()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.ctx.registry
    }

    pub fn identity_for_connection(&self, id: ConnectionId) -> Option<PeerIdentity> {
        self.ctx.registry.identity_for_connection(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    fn set_lobby_state(&mut self, new: LobbyState) {
        let old = self.lobby_state;
        if old == new {
            return;
        }
        info!("lobby state {:?} -> {:?}", old, new);
        self.lobby_state = new;
        self.ctx.events.send_event(SessionEvent::LobbyStateChanged { old, new });
    }

    fn fail(&mut self, reason: SessionError) {
        warn!("session failed: {}", reason);
        self.last_failure = Some(reason.clone());
        self.ctx.events.send_event(SessionEvent::ConnectionFailed { reason });
        self.set_lobby_state(LobbyState::Failed);
    }

    /// Creates a new directory group owned by the local peer, leaving the current group if there
    ///  is one. The local peer becomes host once the directory confirms the group.
    pub fn create_group(&mut self) -> Result<GroupId, SessionError> {
        self.teardown();

        let group = self.ctx.directory.create_group(self.ctx.config.max_members)
            .map_err(|e| SessionError::Directory(e.to_string()))?;
        info!("created {:?}", group);

        self.group = Some(group);
        self.set_lobby_state(LobbyState::Connecting);
        Ok(group)
    }

    /// Joins a directory group, leaving the current group if there is one
    pub fn join_group(&mut self, group: GroupId) -> Result<(), SessionError> {
        self.teardown();

        info!("joining {:?}", group);
        self.group = Some(group);
        self.negotiator = Some(Negotiator::Join(JoinNegotiator::new(group, Instant::now())));
        self.set_lobby_state(LobbyState::Connecting);

        if let Err(e) = self.ctx.directory.join_group(group) {
            let reason = SessionError::Directory(e.to_string());
            if let Some(Negotiator::Join(join)) = &mut self.negotiator {
                join.fail(&mut self.ctx, reason.clone());
            }
            self.last_failure = Some(reason.clone());
            self.set_lobby_state(LobbyState::Failed);
            return Err(reason);
        }
        Ok(())
    }

    /// Joins the group named by a `+connect_lobby <group>` launch argument, if there is one.
    ///  Returns `true` if joining was started.
    pub fn handle_launch_args<S: AsRef<str>>(&mut self, args: &[S]) -> Result<bool, SessionError> {
        match connect_lobby_from_args(args) {
            Some(group) => {
                self.join_group(group)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Invites peers into the group. Outside of a group, this creates one and invites as soon as
    ///  the server is ready. While connecting, this does nothing.
    pub fn invite_friends(&mut self) -> Result<(), SessionError> {
        if self.lobby_state == LobbyState::Connecting && self.group.is_some() {
            debug!("still connecting - not inviting");
            return Ok(());
        }

        let Some(group) = self.group else {
            self.create_group()?;
            self.invite_when_ready = true;
            return Ok(());
        };

        match &mut self.negotiator {
            Some(Negotiator::Host(host)) if !host.is_ready() => host.invite_when_ready(),
            _ => host::invite(&self.ctx, group),
        }
        Ok(())
    }

    /// Aborts entering a group. Returns `false` if there was nothing to cancel.
    pub fn cancel(&mut self) -> bool {
        if self.lobby_state != LobbyState::Connecting {
            return false;
        }
        info!("cancelling");
        self.teardown();
        self.set_lobby_state(LobbyState::Cancelled);
        true
    }

    /// Leaves the session: remote peers are notified on a best-effort basis, all substrate
    ///  sessions are closed, the registry is cleared and the group is left.
    pub fn disconnect(&mut self) {
        info!("disconnecting");
        self.teardown();
        self.set_lobby_state(LobbyState::Disconnected);
        self.ctx.events.send_event(SessionEvent::Disconnected);
    }

    fn teardown(&mut self) {
        let control_channel = self.ctx.config.control_channel;
        let mut disconnect = BytesMut::new();
        ControlMessage::Disconnect.ser(&mut disconnect);

        for connection in self.ctx.registry.iter_mut() {
            if connection.is_loopback() || !connection.is_connected() {
                continue;
            }
            if let Err(e) = connection.send_message(ControlMessageType::Disconnect.into(), &disconnect, control_channel, &self.ctx.handlers) {
                debug!("notifying {:?} of disconnect failed: {}", connection.remote_identity(), e);
            }
        }

        for connection in self.ctx.registry.clear() {
            if !connection.is_loopback() {
                self.ctx.packet_channel.close_session(connection.remote_identity());
            }
        }

        if let Some(group) = self.group.take() {
            debug!("leaving {:?}", group);
            self.ctx.directory.leave_group(group);
        }

        self.negotiator = None;
        self.invite_when_ready = false;
        while self.control_messages.try_recv().is_ok() {}
    }

    /// Registers the handler for an application message type. Control message types are
    ///  reserved.
    pub fn register_handler(&mut self, msg_type: i16, handler: Arc<dyn MessageHandler>) -> Result<(), SessionError> {
        if ControlMessageType::is_reserved(msg_type) {
            return Err(SessionError::ReservedMessageType(msg_type));
        }
        self.ctx.handlers.register(msg_type, handler)
    }

    pub fn deregister_handler(&mut self, msg_type: i16) -> bool {
        if ControlMessageType::is_reserved(msg_type) {
            return false;
        }
        self.ctx.handlers.deregister(msg_type)
    }

    fn check_msg_type(msg_type: i16) -> Result<(), SessionError> {
        if ControlMessageType::is_reserved(msg_type) {
            return Err(SessionError::ReservedMessageType(msg_type));
        }
        Ok(())
    }

    /// Sends a message to a peer right away, in a packet of its own. Sending to the local
    ///  identity on a host delivers through the loopback connection.
    pub fn send_message(&mut self, peer: PeerIdentity, msg_type: i16, payload: &[u8], channel: u8) -> Result<(), SessionError> {
        Self::check_msg_type(msg_type)?;
        let handlers = &self.ctx.handlers;
        ready_connection(&mut self.ctx.registry, peer)?
            .send_message(msg_type, payload, channel, handlers)
    }

    /// Adds a message to the peer's outbound batch for the channel, which is sent at the end of
    ///  the tick
    pub fn queue_message(&mut self, peer: PeerIdentity, msg_type: i16, payload: &[u8], channel: u8) -> Result<(), SessionError> {
        Self::check_msg_type(msg_type)?;
        let handlers = &self.ctx.handlers;
        ready_connection(&mut self.ctx.registry, peer)?
            .queue_message(msg_type, payload, channel, handlers)
    }

    /// Sends a raw packet (one or more framed messages) to a peer
    pub fn send(&mut self, peer: PeerIdentity, buf: &[u8], channel: u8) -> Result<(), SessionError> {
        let handlers = &self.ctx.handlers;
        ready_connection(&mut self.ctx.registry, peer)?
            .send(buf, channel, handlers)
    }

    /// Sends a message to the host - on a host, this is delivered through the loopback
    pub fn send_to_host(&mut self, msg_type: i16, payload: &[u8], channel: u8) -> Result<(), SessionError> {
        Self::check_msg_type(msg_type)?;
        let handlers = &self.ctx.handlers;
        let connection = self.ctx.registry.resolve_host_mut()?;
        if !connection.is_connected() {
            return Err(SessionError::ConnectionNotReady(connection.remote_identity()));
        }
        connection.send_message(msg_type, payload, channel, handlers)
    }

    /// Queues a message for every connection that is ready, the loopback included. All ready
    ///  peers get the message even if sending to some of them fails; the first failure is
    ///  returned.
    pub fn send_to_ready_peers(&mut self, msg_type: i16, payload: &[u8], channel: u8) -> Result<usize, SessionError> {
        Self::check_msg_type(msg_type)?;

        let handlers = &self.ctx.handlers;
        let mut num_sent = 0;
        let mut first_error = None;
        for connection in self.ctx.registry.iter_mut().filter(|c| c.is_connected()) {
            match connection.queue_message(msg_type, payload, channel, handlers) {
                Ok(()) => num_sent += 1,
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(num_sent),
        }
    }

    /// Sends all pending outbound batches. This happens at the end of every tick anyway.
    pub fn flush(&mut self) {
        let handlers = &self.ctx.handlers;
        for connection in self.ctx.registry.iter_mut() {
            if let Err(e) = connection.flush(handlers) {
                warn!("flushing messages to {:?} failed: {}", connection.remote_identity(), e);
            }
        }
    }

    /// One scheduling step. This never blocks.
    pub fn tick(&mut self) {
        let now = Instant::now();

        self.process_directory_events(now);
        self.step_negotiator(now);
        self.process_session_requests(now);
        self.dispatch(now);
        self.process_control_messages();
        self.flush();
        self.sync_lobby_state();
    }

    fn process_directory_events(&mut self, now: Instant) {
        while let Some(event) = self.ctx.directory.poll_event() {
            debug!("directory event: {:?}", event);

            match event {
                DirectoryEvent::JoinRequested { group } => {
                    info!("invitation to {:?} accepted", group);
                    if let Err(e) = self.join_group(group) {
                        warn!("joining {:?} failed: {}", group, e);
                    }
                }
                DirectoryEvent::GroupEntered { group } if self.group == Some(group) => self.on_group_entered(group, now),
                DirectoryEvent::GroupEnterFailed { group } if self.group == Some(group) => {
                    self.group = None;
                    self.negotiator = None;
                    self.fail(SessionError::Directory(format!("entering {:?} failed", group)));
                }
                DirectoryEvent::MemberJoined { group, peer } if self.group == Some(group) => {
                    self.ctx.events.send_event(SessionEvent::MemberJoined { peer });
                }
                DirectoryEvent::MemberLeft { group, peer } if self.group == Some(group) => self.on_member_left(peer),
                other => debug!("ignoring directory event {:?} for a group other than {:?}", other, self.group),
            }
        }
    }

    fn on_group_entered(&mut self, group: GroupId, now: Instant) {
        match self.ctx.directory.owner_of(group) {
            Some(owner) if owner == self.ctx.myself => {
                let host = HostNegotiator::start(&mut self.ctx, group, self.invite_when_ready);
                self.invite_when_ready = false;
                self.negotiator = Some(Negotiator::Host(host));
                self.set_lobby_state(LobbyState::Connected);
            }
            Some(owner) => {
                let negotiator = self.negotiator.get_or_insert_with(|| Negotiator::Join(JoinNegotiator::new(group, now)));
                match negotiator {
                    Negotiator::Join(join) => join.on_group_entered(&mut self.ctx, owner, now),
                    Negotiator::Host(_) => {
                        warn!("{:?} is owned by {:?} now - not hosting any more", group, owner);
                        let mut join = JoinNegotiator::new(group, now);
                        join.on_group_entered(&mut self.ctx, owner, now);
                        *negotiator = Negotiator::Join(join);
                    }
                }
                self.set_lobby_state(LobbyState::Connected);
            }
            None => {
                self.fail(SessionError::Directory(format!("{:?} has no owner", group)));
            }
        }
    }

    fn on_member_left(&mut self, peer: PeerIdentity) {
        let outcome = match &mut self.negotiator {
            Some(Negotiator::Host(host)) => {
                host.on_member_left(&mut self.ctx, peer);
                JoinOutcome::Continue
            }
            Some(Negotiator::Join(join)) => join.on_member_left(&mut self.ctx, peer),
            None => JoinOutcome::Continue,
        };

        if outcome == JoinOutcome::HostDeparted {
            self.disconnect();
        }
    }

    fn step_negotiator(&mut self, now: Instant) {
        match &mut self.negotiator {
            Some(Negotiator::Host(host)) => host.on_tick(&mut self.ctx, now),
            Some(Negotiator::Join(join)) => join.on_tick(&mut self.ctx, now),
            None => {}
        }
    }

    fn process_session_requests(&mut self, now: Instant) {
        while let Some(peer) = self.ctx.packet_channel.poll_session_request() {
            match &mut self.negotiator {
                Some(Negotiator::Host(host)) if host.is_ready() => host.on_session_request(&mut self.ctx, peer, now),
                other => {
                    let reason = match other {
                        Some(Negotiator::Join(_)) => SessionError::UnauthorizedPeer(peer),
                        _ => SessionError::RoleNotEstablished,
                    };
                    debug!("rejecting session request from {:?}: {}", peer, reason);
                    self.ctx.packet_channel.close_session(peer);
                    self.ctx.events.send_event(SessionEvent::PeerRejected { peer, reason });
                }
            }
        }
    }

    fn dispatch(&mut self, now: Instant) {
        // a joiner's control channel belongs to the negotiator until the handshake is complete
        if let Some(Negotiator::Join(join)) = &self.negotiator {
            if !join.is_established() {
                return;
            }
        }

        let report = dispatch_incoming(
            self.ctx.packet_channel.as_ref(),
            &self.ctx.config.channel_spec,
            &mut self.ctx.registry,
            &self.ctx.handlers,
            self.ctx.config.max_packets_per_tick,
        );

        if let Some(Negotiator::Host(host)) = &mut self.negotiator {
            host.recover_orphans(&mut self.ctx, &report.orphaned, now);
        }
    }

    fn process_control_messages(&mut self) {
        while let Ok((from, msg)) = self.control_messages.try_recv() {
            let outcome = match &mut self.negotiator {
                Some(Negotiator::Host(host)) => {
                    host.on_control_message(&mut self.ctx, from, msg);
                    JoinOutcome::Continue
                }
                Some(Negotiator::Join(join)) => join.on_control_message(&mut self.ctx, from, msg),
                None => {
                    debug!("control message {:?} from {:?} outside of a session - ignoring", msg, from);
                    JoinOutcome::Continue
                }
            };

            if outcome == JoinOutcome::HostDeparted {
                self.disconnect();
                return;
            }
        }
    }

    fn sync_lobby_state(&mut self) {
        let failure = match &self.negotiator {
            Some(Negotiator::Join(join)) if join.is_failed() => join.failure().cloned(),
            _ => None,
        };

        if let Some(failure) = failure {
            if self.lobby_state != LobbyState::Failed {
                self.last_failure = Some(failure);
                self.set_lobby_state(LobbyState::Failed);
            }
        }
    }
}

/// Application traffic goes only to connections that completed the handshake
fn ready_connection(registry: &mut ConnectionRegistry, peer: PeerIdentity) -> Result<&mut LogicalConnection, SessionError> {
    let connection = registry.lookup_mut(peer)
        .ok_or(SessionError::UnknownPeer(peer))?;
    if !connection.is_connected() {
        return Err(SessionError::ConnectionNotReady(peer));
    }
    Ok(connection)
}
