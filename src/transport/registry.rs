use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::SessionError;
use crate::substrate::peer_identity::PeerIdentity;
use crate::transport::connection::{ConnectionId, Liveness, LogicalConnection};

/// The authoritative mapping from peer identity to [LogicalConnection], with at most one
///  connection per identity.
///
/// Apart from the per-identity entries, the registry knows two distinguished entries: the
///  connection representing 'me' (the loopback on a host, the connection to the server on a
///  joiner), and the 'primary' connection representing the host. Both are set by negotiation, and
///  resolving them before that is API misuse.
///
/// The registry is owned by the session and mutated only from within a tick, so it needs no
///  locking. Connections are inserted fully constructed, lookups never see a half-built entry.
pub struct ConnectionRegistry {
    myself: PeerIdentity,
    connections: FxHashMap<PeerIdentity, LogicalConnection>,
    self_entry: Option<PeerIdentity>,
    primary: Option<PeerIdentity>,
    next_connection_id: u32,
}

impl ConnectionRegistry {
    pub fn new(myself: PeerIdentity) -> ConnectionRegistry {
        ConnectionRegistry {
            myself,
            connections: Default::default(),
            self_entry: None,
            primary: None,
            next_connection_id: 1,
        }
    }

    pub fn myself(&self) -> PeerIdentity {
        self.myself
    }

    /// Connection ids are never reused within a session
    pub fn next_connection_id(&mut self) -> ConnectionId {
        let result = ConnectionId(self.next_connection_id);
        self.next_connection_id = self.next_connection_id.wrapping_add(1);
        result
    }

    /// Registers a connection for its remote identity. An existing connection for the same
    ///  identity that is still live causes [SessionError::DuplicatePeer]; a disconnected one is
    ///  replaced.
    pub fn register(&mut self, connection: LogicalConnection) -> Result<&mut LogicalConnection, SessionError> {
        let peer = connection.remote_identity();

        match self.connections.entry(peer) {
            Entry::Occupied(e) if e.get().liveness() != Liveness::Disconnected => {
                Err(SessionError::DuplicatePeer(peer))
            }
            Entry::Occupied(mut e) => {
                debug!("replacing disconnected {:?} with {:?}", e.get(), connection);
                e.insert(connection);
                Ok(e.into_mut())
            }
            Entry::Vacant(e) => {
                debug!("registering {:?}", connection);
                Ok(e.insert(connection))
            }
        }
    }

    /// Returns the live connection registered for `peer`, registering a new one only if there is
    ///  none. The second element of the result is `true` if the connection was newly created.
    pub fn get_or_register(&mut self, peer: PeerIdentity, create: impl FnOnce(ConnectionId) -> LogicalConnection) -> (&mut LogicalConnection, bool) {
        let id = ConnectionId(self.next_connection_id);

        let result = match self.connections.entry(peer) {
            Entry::Occupied(e) if e.get().liveness() != Liveness::Disconnected => {
                return (e.into_mut(), false);
            }
            Entry::Occupied(mut e) => {
                e.insert(create(id));
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(create(id)),
        };

        debug!("registering {:?}", result);
        self.next_connection_id = self.next_connection_id.wrapping_add(1);
        (result, true)
    }

    pub fn lookup(&self, peer: PeerIdentity) -> Option<&LogicalConnection> {
        self.connections.get(&peer)
    }

    pub fn lookup_mut(&mut self, peer: PeerIdentity) -> Option<&mut LogicalConnection> {
        self.connections.get_mut(&peer)
    }

    pub fn contains(&self, peer: PeerIdentity) -> bool {
        self.connections.contains_key(&peer)
    }

    /// Removes and disconnects the connection for `peer`, if there is one. Removing an unknown
    ///  identity is a no-op.
    pub fn remove(&mut self, peer: PeerIdentity) -> Option<LogicalConnection> {
        let mut removed = self.connections.remove(&peer)?;
        removed.mark_disconnected();
        debug!("removed {:?}", removed);

        if self.self_entry == Some(peer) {
            self.self_entry = None;
        }
        if self.primary == Some(peer) {
            self.primary = None;
        }
        Some(removed)
    }

    pub fn set_self(&mut self, peer: PeerIdentity) {
        self.self_entry = Some(peer);
    }

    pub fn set_primary(&mut self, peer: PeerIdentity) {
        self.primary = Some(peer);
    }

    pub fn self_identity(&self) -> Option<PeerIdentity> {
        self.self_entry
    }

    pub fn primary_identity(&self) -> Option<PeerIdentity> {
        self.primary
    }

    /// the connection representing the local peer: the loopback on a host, the connection to the
    ///  server on a joiner
    pub fn resolve_self(&self) -> Result<&LogicalConnection, SessionError> {
        self.self_entry
            .and_then(|peer| self.connections.get(&peer))
            .ok_or(SessionError::RoleNotEstablished)
    }

    /// the connection representing the host. On a host, this is the loopback connection.
    pub fn resolve_host(&self) -> Result<&LogicalConnection, SessionError> {
        self.primary
            .and_then(|peer| self.connections.get(&peer))
            .ok_or(SessionError::RoleNotEstablished)
    }

    pub fn resolve_host_mut(&mut self) -> Result<&mut LogicalConnection, SessionError> {
        match self.primary {
            Some(peer) => self.connections.get_mut(&peer)
                .ok_or(SessionError::RoleNotEstablished),
            None => Err(SessionError::RoleNotEstablished),
        }
    }

    pub fn identity_for_connection(&self, id: ConnectionId) -> Option<PeerIdentity> {
        self.connections.values()
            .find(|c| c.id() == id)
            .map(|c| c.remote_identity())
    }

    /// Removes all connections, returning them in disconnected state
    pub fn clear(&mut self) -> Vec<LogicalConnection> {
        self.self_entry = None;
        self.primary = None;
        self.connections.drain()
            .map(|(_, mut c)| {
                c.mark_disconnected();
                c
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item=&LogicalConnection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item=&mut LogicalConnection> {
        self.connections.values_mut()
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use rstest::rstest;
    use super::*;
    use crate::substrate::MockPacketChannel;
    use crate::test_util::identity::test_identity;
    use crate::transport::channel_spec::ChannelSpec;
    use crate::transport::connection::ConnectionRole;

    fn connection(id: ConnectionId, remote: PeerIdentity, role: ConnectionRole) -> LogicalConnection {
        LogicalConnection::new(id, test_identity(1), remote, role, Arc::new(ChannelSpec::default()), Arc::new(MockPacketChannel::new()), 1200)
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(test_identity(1))
    }

    #[test]
    fn test_register_lookup_remove() {
        let mut registry = registry();
        let id = registry.next_connection_id();
        registry.register(connection(id, test_identity(2), ConnectionRole::ClientRemote)).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(test_identity(2)).map(|c| c.id()), Some(id));
        assert!(registry.lookup(test_identity(3)).is_none());
        assert_eq!(registry.identity_for_connection(id), Some(test_identity(2)));

        let removed = registry.remove(test_identity(2)).unwrap();
        assert_eq!(removed.liveness(), Liveness::Disconnected);
        assert!(registry.is_empty());
        assert_eq!(registry.identity_for_connection(id), None);

        // idempotent
        assert!(registry.remove(test_identity(2)).is_none());
    }

    #[rstest]
    #[case::connecting(false)]
    #[case::connected(true)]
    fn test_register_duplicate(#[case] connected: bool) {
        let mut registry = registry();
        let first = registry.register(connection(ConnectionId(1), test_identity(2), ConnectionRole::ClientRemote)).unwrap();
        if connected {
            first.mark_connected();
        }

        let result = registry.register(connection(ConnectionId(2), test_identity(2), ConnectionRole::ClientRemote))
            .map(|_| ());
        assert_eq!(result, Err(SessionError::DuplicatePeer(test_identity(2))));
        assert_eq!(registry.lookup(test_identity(2)).map(|c| c.id()), Some(ConnectionId(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_replaces_disconnected() {
        let mut registry = registry();
        registry.register(connection(ConnectionId(1), test_identity(2), ConnectionRole::ClientRemote)).unwrap()
            .mark_disconnected();

        registry.register(connection(ConnectionId(2), test_identity(2), ConnectionRole::ClientRemote)).unwrap();
        assert_eq!(registry.lookup(test_identity(2)).map(|c| c.id()), Some(ConnectionId(2)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_or_register_is_idempotent() {
        let mut registry = registry();

        let (conn, created) = registry.get_or_register(test_identity(2), |id| connection(id, test_identity(2), ConnectionRole::ClientRemote));
        assert!(created);
        let first_id = conn.id();

        let (conn, created) = registry.get_or_register(test_identity(2), |_| panic!("must not create a second connection"));
        assert!(!created);
        assert_eq!(conn.id(), first_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_before_negotiation() {
        let registry = registry();
        assert_eq!(registry.resolve_self().map(|c| c.id()), Err(SessionError::RoleNotEstablished));
        assert_eq!(registry.resolve_host().map(|c| c.id()), Err(SessionError::RoleNotEstablished));
    }

    #[test]
    fn test_resolve_distinguished_entries() {
        let mut registry = registry();
        registry.register(connection(ConnectionId(1), test_identity(1), ConnectionRole::ClientLocal)).unwrap();
        registry.register(connection(ConnectionId(2), test_identity(2), ConnectionRole::ClientRemote)).unwrap();
        registry.set_self(test_identity(1));
        registry.set_primary(test_identity(1));

        assert_eq!(registry.resolve_self().map(|c| c.id()), Ok(ConnectionId(1)));
        assert_eq!(registry.resolve_host().map(|c| c.id()), Ok(ConnectionId(1)));

        registry.remove(test_identity(1));
        assert_eq!(registry.resolve_self().map(|c| c.id()), Err(SessionError::RoleNotEstablished));
        assert_eq!(registry.resolve_host().map(|c| c.id()), Err(SessionError::RoleNotEstablished));
    }

    #[test]
    fn test_clear() {
        let mut registry = registry();
        registry.register(connection(ConnectionId(1), test_identity(1), ConnectionRole::ClientLocal)).unwrap();
        registry.register(connection(ConnectionId(2), test_identity(2), ConnectionRole::ClientRemote)).unwrap();
        registry.set_self(test_identity(1));

        let cleared = registry.clear();
        assert_eq!(cleared.len(), 2);
        assert!(cleared.iter().all(|c| c.liveness() == Liveness::Disconnected));
        assert!(registry.is_empty());
        assert!(registry.resolve_self().is_err());
    }
}
