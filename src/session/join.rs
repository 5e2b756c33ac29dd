use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::error::SessionError;
use crate::session::control_messages::ControlMessage;
use crate::session::session_events::SessionEvent;
use crate::session::{NegotiationState, SessionContext};
use crate::substrate::peer_identity::{GroupId, PeerIdentity};
use crate::transport::connection::ConnectionRole;

/// The joiner side of session negotiation.
///
/// Once the directory confirms membership in the group, the joiner asks the group's owner for a
///  session. The host's zero-length acknowledgement is the signal that the session was accepted:
///  the joiner then registers its connection to the server and sends its readiness (and
///  optionally a spawn request).
///
/// Waiting is expressed as states that are re-checked on every tick, nothing blocks. There is no
///  retry at this level: a timeout or the host leaving before the handshake completes moves the
///  negotiator to [NegotiationState::Failed], reported exactly once.
#[derive(Debug)]
pub struct JoinNegotiator {
    group: GroupId,
    host: Option<PeerIdentity>,
    state: NegotiationState,
    /// start of the current waiting period
    since: Instant,
    failure: Option<SessionError>,
}

/// What a joiner's session does after the negotiator handled an event
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum JoinOutcome {
    Continue,
    /// the host is gone after the handshake completed - the session is over
    HostDeparted,
}

impl JoinNegotiator {
    pub fn new(group: GroupId, now: Instant) -> JoinNegotiator {
        JoinNegotiator {
            group,
            host: None,
            state: NegotiationState::AwaitingDirectoryMembership,
            since: now,
            failure: None,
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn host(&self) -> Option<PeerIdentity> {
        self.host
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == NegotiationState::Established
    }

    pub fn is_failed(&self) -> bool {
        self.state == NegotiationState::Failed
    }

    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    /// The directory confirmed our membership in the group, and reports `host` as its owner
    pub(crate) fn on_group_entered(&mut self, ctx: &mut SessionContext, host: PeerIdentity, now: Instant) {
        if self.state != NegotiationState::AwaitingDirectoryMembership {
            debug!("already negotiating with {:?} - ignoring repeated group entry", self.host);
            return;
        }

        self.host = Some(host);
        info!("requesting a session with host {:?} of {:?}", host, self.group);

        match ctx.packet_channel.request_session(host) {
            Ok(()) => {
                self.state = NegotiationState::AwaitingSubstrateAccept;
                self.since = now;
            }
            Err(e) => {
                self.fail(ctx, SessionError::SendFailed {
                    peer: host,
                    channel: ctx.config.control_channel,
                    reason: e.to_string(),
                });
            }
        }
    }

    pub(crate) fn on_tick(&mut self, ctx: &mut SessionContext, now: Instant) {
        if self.state == NegotiationState::AwaitingSubstrateAccept {
            self.poll_acknowledgement(ctx);
        }
        if self.state == NegotiationState::AwaitingHandshakeAck {
            self.complete_handshake(ctx);
        }
        self.check_timeout(ctx, now);
    }

    fn poll_acknowledgement(&mut self, ctx: &mut SessionContext) {
        let Some(host) = self.host else {
            return;
        };

        for _ in 0..ctx.config.max_packets_per_tick {
            let Some((from, buf)) = ctx.packet_channel.poll_incoming(ctx.config.control_channel) else {
                return;
            };
            if from != host {
                debug!("ignoring packet from {:?} while waiting for the host's acknowledgement", from);
                continue;
            }

            trace!("acknowledgement from host {:?} ({} bytes)", host, buf.len());
            self.state = NegotiationState::AwaitingHandshakeAck;
            return;
        }
    }

    /// Registers the connection to the server once the substrate session is active, and sends
    ///  our readiness. If the session is not active yet, this is retried on the next tick.
    fn complete_handshake(&mut self, ctx: &mut SessionContext) {
        let Some(host) = self.host else {
            return;
        };

        if !ctx.packet_channel.session_is_active(host) {
            trace!("session with {:?} is not active yet", host);
            return;
        }

        let create = ctx.connection_factory(host, ConnectionRole::Server);
        let (connection, _) = ctx.registry.get_or_register(host, create);
        connection.mark_connected();
        ctx.registry.set_primary(host);
        ctx.registry.set_self(host);

        info!("connected to host {:?}", host);
        ctx.events.send_event(SessionEvent::ConnectedToHost { host });

        let myself = ctx.myself;
        let mut messages = vec![ControlMessage::Ready(myself)];
        if ctx.config.request_spawn_on_connect {
            messages.push(ControlMessage::SpawnRequest(myself));
        }

        for msg in messages {
            if let Err(e) = send_control_message(ctx, host, &msg) {
                self.fail(ctx, e);
                return;
            }
        }

        self.state = NegotiationState::Established;
    }

    fn check_timeout(&mut self, ctx: &mut SessionContext, now: Instant) {
        match self.state {
            NegotiationState::Established | NegotiationState::Failed => {}
            _ => {
                let elapsed = now.saturating_duration_since(self.since);
                if elapsed >= ctx.config.ack_timeout {
                    let reason = match (self.state, self.host) {
                        (NegotiationState::AwaitingDirectoryMembership, _) | (_, None) =>
                            SessionError::Directory(format!("membership in {:?} was not confirmed within {:?}", self.group, elapsed)),
                        // acknowledged, but the substrate never reported the session as active
                        (NegotiationState::AwaitingHandshakeAck, Some(host)) => SessionError::SessionInactive(host),
                        (_, Some(host)) => SessionError::NegotiationTimeout { peer: host, elapsed },
                    };
                    self.fail(ctx, reason);
                }
            }
        }
    }

    /// Terminal. Failing an already failed negotiation has no effect, so there is exactly one
    ///  failure notification.
    pub(crate) fn fail(&mut self, ctx: &mut SessionContext, reason: SessionError) {
        if self.state == NegotiationState::Failed {
            return;
        }

        error!("joining {:?} failed: {}", self.group, reason);
        self.state = NegotiationState::Failed;
        self.failure = Some(reason.clone());

        if let Some(host) = self.host {
            if ctx.registry.remove(host).is_some() {
                ctx.packet_channel.close_session(host);
            }
        }
        ctx.events.send_event(SessionEvent::ConnectionFailed { reason });
    }

    pub(crate) fn on_member_left(&mut self, ctx: &mut SessionContext, peer: PeerIdentity) -> JoinOutcome {
        if self.host != Some(peer) {
            return JoinOutcome::Continue;
        }

        match self.state {
            NegotiationState::Established => {
                info!("host {:?} left the group", peer);
                self.host_departed(ctx, peer)
            }
            NegotiationState::Failed => JoinOutcome::Continue,
            _ => {
                self.fail(ctx, SessionError::HostLeft(peer));
                JoinOutcome::Continue
            }
        }
    }

    pub(crate) fn on_control_message(&mut self, ctx: &mut SessionContext, from: PeerIdentity, msg: ControlMessage) -> JoinOutcome {
        match msg {
            ControlMessage::Disconnect if self.host == Some(from) => {
                info!("host {:?} closed the session", from);
                match self.state {
                    NegotiationState::Established => self.host_departed(ctx, from),
                    _ => {
                        self.fail(ctx, SessionError::HostLeft(from));
                        JoinOutcome::Continue
                    }
                }
            }
            other => {
                debug!("ignoring {:?} from {:?}", other, from);
                JoinOutcome::Continue
            }
        }
    }

    fn host_departed(&mut self, ctx: &mut SessionContext, host: PeerIdentity) -> JoinOutcome {
        if ctx.registry.remove(host).is_some() {
            ctx.packet_channel.close_session(host);
            ctx.events.send_event(SessionEvent::PeerDisconnected { peer: host });
        }
        JoinOutcome::HostDeparted
    }
}

fn send_control_message(ctx: &mut SessionContext, to: PeerIdentity, msg: &ControlMessage) -> Result<(), SessionError> {
    let mut payload = BytesMut::new();
    msg.ser(&mut payload);

    let channel = ctx.config.control_channel;
    let connection = ctx.registry.lookup_mut(to)
        .ok_or(SessionError::UnknownPeer(to))?;
    connection.send_message(msg.msg_type().into(), &payload, channel, &ctx.handlers)
}
