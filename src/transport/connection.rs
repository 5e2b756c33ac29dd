use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::substrate::PacketChannel;
use crate::substrate::peer_identity::PeerIdentity;
use crate::transport::channel_spec::{ChannelSpec, ReliabilityClass};
use crate::transport::framing::{frame_len, write_frame, FrameReader};
use crate::transport::message_handler::{MessageContext, MessageHandlers};

/// Session-local id of a [LogicalConnection], e.g. for application code that keeps per-connection
///  state without holding on to peer identities
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(pub u32);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionRole {
    /// a joiner's connection to the host
    Server,
    /// the host's loopback connection to itself
    ClientLocal,
    /// the host's connection to a joiner
    ClientRemote,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Liveness {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub messages_received: u64,
    /// application messages that arrived before the connection was ready
    pub messages_dropped: u64,
    pub framing_violations: u64,
}

/// The local end of the link to one remote peer. It frames outbound messages, maps channel
///  indexes to the substrate's send primitives, and decodes inbound packets into handler calls.
///
/// A connection whose remote identity is the local identity is a loopback connection: whatever
///  is sent on it goes straight to its own receive path, the substrate is never involved.
pub struct LogicalConnection {
    id: ConnectionId,
    local: PeerIdentity,
    remote: PeerIdentity,
    role: ConnectionRole,
    liveness: Liveness,
    channel_spec: Arc<ChannelSpec>,
    packet_channel: Arc<dyn PacketChannel>,
    max_packet_size: usize,
    /// one batch per channel, indexed by channel
    outbound: Vec<BytesMut>,
    stats: ConnectionStats,
}

impl Debug for LogicalConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LogicalConnection{{{:?}: {:?}->{:?} {:?} {:?}}}", self.id, self.local, self.remote, self.role, self.liveness)
    }
}

impl LogicalConnection {
    pub fn new(
        id: ConnectionId,
        local: PeerIdentity,
        remote: PeerIdentity,
        role: ConnectionRole,
        channel_spec: Arc<ChannelSpec>,
        packet_channel: Arc<dyn PacketChannel>,
        max_packet_size: usize,
    ) -> LogicalConnection {
        let outbound = channel_spec.channels()
            .map(|_| BytesMut::new())
            .collect();

        LogicalConnection {
            id,
            local,
            remote,
            role,
            liveness: Liveness::Connecting,
            channel_spec,
            packet_channel,
            max_packet_size,
            outbound,
            stats: Default::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.local
    }

    pub fn remote_identity(&self) -> PeerIdentity {
        self.remote
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn is_connected(&self) -> bool {
        self.liveness == Liveness::Connected
    }

    pub fn is_loopback(&self) -> bool {
        self.local == self.remote
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn mark_connected(&mut self) {
        if self.liveness != Liveness::Connected {
            debug!("{:?} is connected", self);
            self.liveness = Liveness::Connected;
        }
    }

    /// Terminal: a disconnected connection is never revived, a new one is registered instead
    pub fn mark_disconnected(&mut self) {
        if self.liveness != Liveness::Disconnected {
            debug!("{:?} is disconnected", self);
            self.liveness = Liveness::Disconnected;
            for batch in &mut self.outbound {
                batch.clear();
            }
        }
    }

    fn class_of(&self, channel: u8) -> Result<ReliabilityClass, SessionError> {
        self.channel_spec.class_of(channel)
            .ok_or(SessionError::InvalidChannel(channel))
    }

    /// Sends a raw packet, i.e. one or more framed messages, on a channel
    pub fn send(&mut self, buf: &[u8], channel: u8, handlers: &MessageHandlers) -> Result<(), SessionError> {
        let class = self.class_of(channel)?;
        if self.liveness == Liveness::Disconnected {
            return Err(SessionError::ConnectionNotReady(self.remote));
        }

        if self.is_loopback() {
            trace!("loopback delivery of {} bytes on channel {}", buf.len(), channel);
            self.receive(buf, channel, handlers);
            return Ok(());
        }

        let result = if class.is_unreliable() {
            self.packet_channel.send_unreliable(self.remote, buf, channel)
        }
        else {
            self.packet_channel.send_reliable(self.remote, buf, channel)
        };

        match result {
            Ok(()) => {
                trace!("sent {} bytes to {:?} on channel {} ({:?})", buf.len(), self.remote, channel, class);
                self.stats.packets_sent += 1;
                Ok(())
            }
            Err(e) => {
                warn!("sending to {:?} on channel {} failed: {}", self.remote, channel, e);
                Err(SessionError::SendFailed {
                    peer: self.remote,
                    channel,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn check_fits_packet(&self, payload: &[u8]) -> Result<(), SessionError> {
        if frame_len(payload.len()) > self.max_packet_size {
            return Err(SessionError::MessageTooLarge(payload.len()));
        }
        Ok(())
    }

    /// Frames a single message and sends it right away, in a packet of its own
    pub fn send_message(&mut self, msg_type: i16, payload: &[u8], channel: u8, handlers: &MessageHandlers) -> Result<(), SessionError> {
        self.class_of(channel)?;
        self.check_fits_packet(payload)?;

        let mut buf = BytesMut::with_capacity(frame_len(payload.len()));
        write_frame(&mut buf, msg_type, payload)?;
        self.send(&buf, channel, handlers)
    }

    /// Appends a message to the channel's outbound batch. The batch is sent on the next
    ///  [LogicalConnection::flush], or before that if adding the message would make the packet
    ///  exceed the maximum packet size. A message that does not fit into a packet on its own is
    ///  rejected.
    pub fn queue_message(&mut self, msg_type: i16, payload: &[u8], channel: u8, handlers: &MessageHandlers) -> Result<(), SessionError> {
        self.class_of(channel)?;
        self.check_fits_packet(payload)?;
        if self.liveness == Liveness::Disconnected {
            return Err(SessionError::ConnectionNotReady(self.remote));
        }

        let idx = channel as usize;
        let pending = self.outbound[idx].len();
        if pending > 0 && pending + frame_len(payload.len()) > self.max_packet_size {
            self.flush_channel(channel, handlers)?;
        }

        write_frame(&mut self.outbound[idx], msg_type, payload)
    }

    fn flush_channel(&mut self, channel: u8, handlers: &MessageHandlers) -> Result<(), SessionError> {
        let idx = channel as usize;
        if self.outbound[idx].is_empty() {
            return Ok(());
        }
        let packet = self.outbound[idx].split().freeze();
        self.send(&packet, channel, handlers)
    }

    /// Sends all pending batches. All channels are flushed even if one of them fails, the first
    ///  failure is returned.
    pub fn flush(&mut self, handlers: &MessageHandlers) -> Result<(), SessionError> {
        let mut result = Ok(());
        for channel in self.channel_spec.channels() {
            if let Err(e) = self.flush_channel(channel, handlers) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn has_pending_messages(&self) -> bool {
        self.outbound.iter()
            .any(|b| !b.is_empty())
    }

    /// Decodes a packet received on a channel, calling the registered handler for each message
    ///  in it. A framing violation ends decoding of the packet, the connection stays alive.
    ///
    /// Until the connection is connected, only control messages are delivered (see
    ///  [MessageHandlers::register_control]); application messages are dropped. The loopback
    ///  is exempt.
    ///
    /// Returns the number of messages that were delivered.
    pub fn receive(&mut self, buf: &[u8], channel: u8, handlers: &MessageHandlers) -> usize {
        self.stats.packets_received += 1;
        let is_ready = self.is_connected() || self.is_loopback();

        let mut num_messages = 0;
        for frame in FrameReader::new(buf) {
            match frame {
                Ok(frame) if !is_ready && !handlers.is_control(frame.msg_type) => {
                    debug!("dropping message type {} from {:?}: connection is not ready", frame.msg_type, self.remote);
                    self.stats.messages_dropped += 1;
                }
                Ok(frame) => {
                    let ctx = MessageContext {
                        from: self.remote,
                        connection_id: self.id,
                        channel,
                        msg_type: frame.msg_type,
                    };
                    handlers.dispatch(&ctx, frame.payload);
                    num_messages += 1;
                }
                Err(e) => {
                    warn!("packet from {:?} on channel {}: {} - discarding the rest of the packet", self.remote, channel, e);
                    self.stats.framing_violations += 1;
                }
            }
        }

        self.stats.messages_received += num_messages as u64;
        num_messages
    }
}

#[cfg(test)]
mod test {
    use anyhow::anyhow;
    use rstest::rstest;
    use super::*;
    use crate::substrate::MockPacketChannel;
    use crate::test_util::handler::TrackingMessageHandler;
    use crate::test_util::identity::test_identity;
    use crate::transport::channel_spec::ReliabilityClass::*;
    use crate::transport::framing::FRAME_HEADER_LEN;

    fn connection(remote: PeerIdentity, packet_channel: MockPacketChannel, max_packet_size: usize) -> LogicalConnection {
        let spec = ChannelSpec::new(vec![ReliableSequenced, Unreliable, UnreliableFragmented, Reliable]).unwrap();
        LogicalConnection::new(ConnectionId(3), test_identity(1), remote, ConnectionRole::ClientRemote, spec, Arc::new(packet_channel), max_packet_size)
    }

    fn tracked(msg_types: &[i16]) -> (MessageHandlers, Arc<TrackingMessageHandler>) {
        let tracker = Arc::new(TrackingMessageHandler::new());
        let mut handlers = MessageHandlers::new();
        for &t in msg_types {
            handlers.register(t, tracker.clone()).unwrap();
        }
        (handlers, tracker)
    }

    #[rstest]
    #[case::reliable_sequenced(0, false)]
    #[case::unreliable(1, true)]
    #[case::unreliable_fragmented(2, true)]
    #[case::reliable(3, false)]
    fn test_send_maps_reliability_class(#[case] channel: u8, #[case] unreliable: bool) {
        let mut packet_channel = MockPacketChannel::new();
        let expected = move |peer: &PeerIdentity, buf: &[u8], ch: &u8| {
            *peer == test_identity(2) && buf.to_vec() == b"abc".to_vec() && *ch == channel
        };
        if unreliable {
            packet_channel.expect_send_unreliable()
                .withf(expected)
                .once()
                .returning(|_, _, _| Ok(()));
        }
        else {
            packet_channel.expect_send_reliable()
                .withf(expected)
                .once()
                .returning(|_, _, _| Ok(()));
        }

        let mut conn = connection(test_identity(2), packet_channel, 1200);
        conn.send(b"abc", channel, &MessageHandlers::new()).unwrap();
        assert_eq!(conn.stats().packets_sent, 1);
    }

    #[test]
    fn test_send_failed() {
        let mut packet_channel = MockPacketChannel::new();
        packet_channel.expect_send_reliable()
            .once()
            .returning(|_, _, _| Err(anyhow!("unreachable")));

        let mut conn = connection(test_identity(2), packet_channel, 1200);
        match conn.send(b"abc", 0, &MessageHandlers::new()) {
            Err(SessionError::SendFailed { peer, channel, reason }) => {
                assert_eq!(peer, test_identity(2));
                assert_eq!(channel, 0);
                assert_eq!(reason, "unreachable");
            }
            other => panic!("expected SendFailed, was {:?}", other),
        }
        assert_eq!(conn.stats().packets_sent, 0);
    }

    #[test]
    fn test_send_invalid_channel() {
        let mut conn = connection(test_identity(2), MockPacketChannel::new(), 1200);
        assert_eq!(conn.send(b"abc", 4, &MessageHandlers::new()), Err(SessionError::InvalidChannel(4)));
        assert_eq!(conn.queue_message(1, b"abc", 9, &MessageHandlers::new()), Err(SessionError::InvalidChannel(9)));
    }

    #[test]
    fn test_send_disconnected() {
        let mut conn = connection(test_identity(2), MockPacketChannel::new(), 1200);
        conn.mark_disconnected();
        assert_eq!(conn.send(b"abc", 0, &MessageHandlers::new()), Err(SessionError::ConnectionNotReady(test_identity(2))));
    }

    #[test]
    fn test_loopback_bypasses_substrate() {
        // no expectations: any substrate call fails the test
        let mut conn = connection(test_identity(1), MockPacketChannel::new(), 1200);
        assert!(conn.is_loopback());

        let (handlers, tracker) = tracked(&[10, 11]);
        conn.send_message(10, b"hello", 0, &handlers).unwrap();
        conn.queue_message(11, b"queued", 1, &handlers).unwrap();
        assert!(tracker.received().len() == 1);
        conn.flush(&handlers).unwrap();

        let received = tracker.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0.from, test_identity(1));
        assert_eq!(received[0].0.msg_type, 10);
        assert_eq!(received[0].1, b"hello");
        assert_eq!(received[1].0.channel, 1);
        assert_eq!(received[1].1, b"queued");
        assert_eq!(conn.stats().packets_sent, 0);
    }

    #[test]
    fn test_queue_batches_messages() {
        let mut packet_channel = MockPacketChannel::new();
        packet_channel.expect_send_reliable()
            .withf(|peer, buf, channel| *peer == test_identity(2) && buf.len() == 2 * frame_len(3) && *channel == 0)
            .once()
            .returning(|_, _, _| Ok(()));

        let mut conn = connection(test_identity(2), packet_channel, 1200);
        let handlers = MessageHandlers::new();
        conn.queue_message(1, b"abc", 0, &handlers).unwrap();
        conn.queue_message(2, b"def", 0, &handlers).unwrap();
        assert!(conn.has_pending_messages());

        conn.flush(&handlers).unwrap();
        assert!(!conn.has_pending_messages());
        // nothing left to send
        conn.flush(&handlers).unwrap();
    }

    #[test]
    fn test_queue_flushes_before_exceeding_packet_size() {
        let mut packet_channel = MockPacketChannel::new();
        packet_channel.expect_send_unreliable()
            .withf(|_, buf, _| buf.len() == 2 * frame_len(4))
            .once()
            .returning(|_, _, _| Ok(()));
        packet_channel.expect_send_unreliable()
            .withf(|_, buf, _| buf.len() == frame_len(4))
            .once()
            .returning(|_, _, _| Ok(()));

        let mut conn = connection(test_identity(2), packet_channel, 2 * frame_len(4) + 1);
        let handlers = MessageHandlers::new();
        for _ in 0..3 {
            conn.queue_message(5, b"pos!", 1, &handlers).unwrap();
        }
        conn.flush(&handlers).unwrap();
        assert_eq!(conn.stats().packets_sent, 2);
    }

    #[rstest]
    #[case::fits(100 - FRAME_HEADER_LEN, true)]
    #[case::one_byte_too_large(100 - FRAME_HEADER_LEN + 1, false)]
    #[case::far_too_large(500, false)]
    fn test_message_size_limit(#[case] payload_len: usize, #[case] fits: bool) {
        let mut packet_channel = MockPacketChannel::new();
        if fits {
            packet_channel.expect_send_unreliable()
                .withf(|_, buf, _| buf.len() == 100)
                .times(2)
                .returning(|_, _, _| Ok(()));
        }

        let mut conn = connection(test_identity(2), packet_channel, 100);
        let handlers = MessageHandlers::new();
        let payload = vec![0u8; payload_len];

        let expected = if fits { Ok(()) } else { Err(SessionError::MessageTooLarge(payload_len)) };
        assert_eq!(conn.queue_message(5, &payload, 1, &handlers), expected);
        assert_eq!(conn.has_pending_messages(), fits);
        conn.flush(&handlers).unwrap();
        assert_eq!(conn.send_message(5, &payload, 1, &handlers), expected);
    }

    #[test]
    fn test_receive_in_order() {
        let mut conn = connection(test_identity(2), MockPacketChannel::new(), 1200);
        conn.mark_connected();
        let (handlers, tracker) = tracked(&[1, 2, 3]);

        let mut buf = BytesMut::new();
        write_frame(&mut buf, 1, b"one").unwrap();
        write_frame(&mut buf, 2, b"").unwrap();
        write_frame(&mut buf, 99, b"unhandled").unwrap();
        write_frame(&mut buf, 3, b"three").unwrap();

        assert_eq!(conn.receive(&buf, 0, &handlers), 4);
        let received = tracker.received().into_iter()
            .map(|(ctx, payload)| (ctx.msg_type, payload))
            .collect::<Vec<_>>();
        assert_eq!(received, vec![(1, b"one".to_vec()), (2, vec![]), (3, b"three".to_vec())]);
        assert_eq!(conn.stats().messages_received, 4);
    }

    #[test]
    fn test_receive_truncated() {
        let mut conn = connection(test_identity(2), MockPacketChannel::new(), 1200);
        conn.mark_connected();
        let (handlers, tracker) = tracked(&[1]);

        let mut buf = BytesMut::new();
        write_frame(&mut buf, 1, b"one").unwrap();
        write_frame(&mut buf, 1, b"two").unwrap();
        let truncated = &buf[..buf.len() - 1];

        assert_eq!(conn.receive(truncated, 0, &handlers), 1);
        assert_eq!(tracker.received().len(), 1);
        assert_eq!(conn.stats().framing_violations, 1);

        // the connection keeps working
        assert_eq!(conn.receive(&buf, 0, &handlers), 2);
        assert_eq!(tracker.received().len(), 3);
    }

    #[test]
    fn test_receive_before_ready_delivers_only_control_messages() {
        let mut conn = connection(test_identity(2), MockPacketChannel::new(), 1200);
        let tracker = Arc::new(TrackingMessageHandler::new());
        let mut handlers = MessageHandlers::new();
        handlers.register(100, tracker.clone()).unwrap();
        handlers.register_control(35, tracker.clone()).unwrap();

        let mut buf = BytesMut::new();
        write_frame(&mut buf, 100, b"early").unwrap();
        write_frame(&mut buf, 35, b"2").unwrap();
        assert_eq!(conn.receive(&buf, 0, &handlers), 1);
        assert_eq!(tracker.received().into_iter().map(|(ctx, _)| ctx.msg_type).collect::<Vec<_>>(), vec![35]);
        assert_eq!(conn.stats().messages_dropped, 1);

        conn.mark_connected();
        assert_eq!(conn.receive(&buf, 0, &handlers), 2);
        assert_eq!(tracker.received().len(), 3);
    }
}
