use crate::substrate::peer_identity::PeerIdentity;

pub fn test_identity(n: u64) -> PeerIdentity {
    PeerIdentity(n)
}
