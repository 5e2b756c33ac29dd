use std::sync::Arc;

use crate::session::Session;
use crate::session::session_config::SessionConfig;
use crate::substrate::memory::MemoryNetwork;
use crate::substrate::peer_identity::PeerIdentity;

/// A session for a new endpoint on the network
pub fn session(network: &MemoryNetwork, identity: PeerIdentity, config: SessionConfig) -> Session {
    let endpoint = network.endpoint(identity);
    Session::new(Arc::new(config), endpoint.clone(), endpoint)
        .expect("invalid session config")
}

/// Ticks all sessions in turn, `rounds` times
pub fn tick_all(sessions: &mut [&mut Session], rounds: usize) {
    for _ in 0..rounds {
        for session in sessions.iter_mut() {
            session.tick();
        }
    }
}
