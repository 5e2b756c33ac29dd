use std::fmt::{Debug, Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;

use anyhow::anyhow;

/// A participant's identity as handed out by the peer directory / packet channel substrate. It is
///  independent of any network address: the substrate takes care of NAT traversal and relaying,
///  so this is all the core ever uses to address a peer.
///
/// On the wire (readiness and spawn-request payloads) an identity is its decimal text
///  representation.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerIdentity(pub u64);

impl Debug for PeerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[peer:{}]", self.0)
    }
}

impl Display for PeerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerIdentity(s.trim().parse()?))
    }
}

impl PeerIdentity {
    pub fn to_text(&self) -> String {
        self.0.to_string()
    }

    pub fn try_from_text(buf: &[u8]) -> anyhow::Result<PeerIdentity> {
        let s = std::str::from_utf8(buf)?;
        s.parse()
            .map_err(|e| anyhow!("invalid peer identity {:?}: {}", s, e))
    }
}

/// Identifies a group (a 'lobby') in the peer directory
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GroupId(pub u64);

impl Debug for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[group:{}]", self.0)
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(GroupId(s.trim().parse()?))
    }
}
