//! The multi-channel transport on top of the packet substrate: channel configuration, message
//!  framing, per-peer [connection::LogicalConnection]s and the [registry::ConnectionRegistry]
//!  routing inbound packets to them.

pub mod channel_spec;
pub mod connection;
pub mod framing;
pub mod message_handler;
pub mod registry;

use tracing::{debug, trace};

use crate::substrate::PacketChannel;
use crate::substrate::peer_identity::PeerIdentity;
use crate::transport::channel_spec::ChannelSpec;
use crate::transport::message_handler::MessageHandlers;
use crate::transport::registry::ConnectionRegistry;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DispatchReport {
    /// number of packets handed to a registered connection
    pub delivered: usize,
    /// senders of packets that could not be resolved to a registered connection, in order of
    ///  arrival and without duplicates
    pub orphaned: Vec<PeerIdentity>,
}

/// The per-tick dispatch step: for every configured channel, read the datagrams the substrate has
///  available (at most `max_packets_per_channel` per channel), resolve each sender to its
///  registered connection and feed the packet to it.
///
/// Packets from senders without a registered connection are dropped. That happens legitimately
///  when a peer's removal races ahead of the substrate tearing down its session, so it is not an
///  error; the senders are reported for the caller to recover.
pub fn dispatch_incoming(
    packet_channel: &dyn PacketChannel,
    channel_spec: &ChannelSpec,
    registry: &mut ConnectionRegistry,
    handlers: &MessageHandlers,
    max_packets_per_channel: usize,
) -> DispatchReport {
    let mut report = DispatchReport::default();

    for channel in channel_spec.channels() {
        for _ in 0..max_packets_per_channel {
            let Some((from, buf)) = packet_channel.poll_incoming(channel) else {
                break;
            };

            match registry.lookup_mut(from) {
                Some(connection) => {
                    trace!("received {} bytes from {:?} on channel {}", buf.len(), from, channel);
                    connection.receive(&buf, channel, handlers);
                    report.delivered += 1;
                }
                None => {
                    debug!("dropping packet from {:?} on channel {}: no registered connection", from, channel);
                    if !report.orphaned.contains(&from) {
                        report.orphaned.push(from);
                    }
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use bytes::BytesMut;
    use super::*;
    use crate::substrate::memory::MemoryNetwork;
    use crate::test_util::handler::TrackingMessageHandler;
    use crate::test_util::identity::test_identity;
    use crate::transport::connection::{ConnectionRole, LogicalConnection};
    use crate::transport::framing::write_frame;

    fn framed(msg_type: i16, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, msg_type, payload).unwrap();
        buf
    }

    struct Fixture {
        network: MemoryNetwork,
        local: Arc<dyn PacketChannel>,
        registry: ConnectionRegistry,
        handlers: MessageHandlers,
        tracker: Arc<TrackingMessageHandler>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let network = MemoryNetwork::new();
            let local: Arc<dyn PacketChannel> = network.endpoint(test_identity(1));
            let tracker = Arc::new(TrackingMessageHandler::new());
            let mut handlers = MessageHandlers::new();
            handlers.register(100, tracker.clone()).unwrap();

            Fixture {
                network,
                local,
                registry: ConnectionRegistry::new(test_identity(1)),
                handlers,
                tracker,
            }
        }

        fn register(&mut self, remote: PeerIdentity) {
            let id = self.registry.next_connection_id();
            let connection = LogicalConnection::new(id, test_identity(1), remote, ConnectionRole::ClientRemote, Arc::new(ChannelSpec::default()), self.local.clone(), 1200);
            self.registry.register(connection).unwrap()
                .mark_connected();
            self.local.accept_session(remote);
        }

        fn dispatch(&mut self, max_packets: usize) -> DispatchReport {
            dispatch_incoming(self.local.as_ref(), &ChannelSpec::default(), &mut self.registry, &self.handlers, max_packets)
        }
    }

    #[test]
    fn test_dispatch_routes_to_connection() {
        let mut fixture = Fixture::new();
        fixture.register(test_identity(2));
        let remote = fixture.network.endpoint(test_identity(2));

        remote.send_reliable(test_identity(1), &framed(100, b"a"), 0).unwrap();
        remote.send_unreliable(test_identity(1), &framed(100, b"b"), 1).unwrap();

        let report = fixture.dispatch(256);
        assert_eq!(report, DispatchReport { delivered: 2, orphaned: vec![] });

        let received = fixture.tracker.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0.from, test_identity(2));
        assert_eq!(received[0].0.channel, 0);
        assert_eq!(received[1].0.channel, 1);
        assert_eq!(received[1].1, b"b");
    }

    #[test]
    fn test_dispatch_drops_packet_of_removed_peer() {
        let mut fixture = Fixture::new();
        fixture.register(test_identity(2));
        fixture.register(test_identity(3));
        let remote_2 = fixture.network.endpoint(test_identity(2));
        let remote_3 = fixture.network.endpoint(test_identity(3));

        remote_2.send_reliable(test_identity(1), &framed(100, b"in flight"), 0).unwrap();
        remote_3.send_reliable(test_identity(1), &framed(100, b"still registered"), 0).unwrap();
        remote_2.send_reliable(test_identity(1), &framed(100, b"in flight 2"), 0).unwrap();

        // removal races ahead of substrate teardown: the packets are already in the poll buffer
        fixture.registry.remove(test_identity(2));

        let report = fixture.dispatch(256);
        assert_eq!(report, DispatchReport { delivered: 1, orphaned: vec![test_identity(2)] });

        let received = fixture.tracker.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, b"still registered");
    }

    #[test]
    fn test_dispatch_bounded_per_tick() {
        let mut fixture = Fixture::new();
        fixture.register(test_identity(2));
        let remote = fixture.network.endpoint(test_identity(2));

        for _ in 0..5 {
            remote.send_reliable(test_identity(1), &framed(100, b"x"), 0).unwrap();
        }

        assert_eq!(fixture.dispatch(3).delivered, 3);
        assert_eq!(fixture.dispatch(3).delivered, 2);
        assert_eq!(fixture.dispatch(3).delivered, 0);
    }

    #[test]
    fn test_dispatch_survives_malformed_packet() {
        let mut fixture = Fixture::new();
        fixture.register(test_identity(2));
        let remote = fixture.network.endpoint(test_identity(2));

        let mut buf = framed(100, b"ok");
        buf.extend_from_slice(&[0, 9, 0, 100, 1]);
        remote.send_reliable(test_identity(1), &buf, 0).unwrap();
        remote.send_reliable(test_identity(1), &framed(100, b"next"), 0).unwrap();

        assert_eq!(fixture.dispatch(256).delivered, 2);
        assert_eq!(fixture.tracker.received().len(), 2);
        assert_eq!(fixture.registry.lookup(test_identity(2)).map(|c| c.stats().framing_violations), Some(1));
    }
}
