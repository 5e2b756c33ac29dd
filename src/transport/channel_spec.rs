use std::sync::Arc;

use anyhow::anyhow;

/// The delivery guarantee of a channel. Only [ReliabilityClass::is_unreliable] classes go through
///  the substrate's unreliable send primitive, everything else is sent reliably.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ReliabilityClass {
    Reliable,
    /// reliable, and delivered in the order it was sent
    ReliableSequenced,
    ReliableFragmented,
    Unreliable,
    /// unreliable, older messages arriving after newer ones are superseded
    UnreliableSequenced,
    UnreliableFragmented,
}

impl ReliabilityClass {
    pub fn is_unreliable(&self) -> bool {
        use ReliabilityClass::*;

        match self {
            Unreliable | UnreliableSequenced | UnreliableFragmented => true,
            Reliable | ReliableSequenced | ReliableFragmented => false,
        }
    }

    /// Message order is preserved end-to-end only for channels marked as ordered
    pub fn is_ordered(&self) -> bool {
        *self == ReliabilityClass::ReliableSequenced
    }
}

/// The index-addressed list of channels of a session. It is fixed for the lifetime of a session
///  and must be identical for all peers - this is configuration, not negotiated.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelSpec {
    classes: Vec<ReliabilityClass>,
}

impl Default for ChannelSpec {
    fn default() -> Self {
        ChannelSpec {
            classes: vec![ReliabilityClass::ReliableSequenced, ReliabilityClass::Unreliable],
        }
    }
}

impl ChannelSpec {
    pub const MAX_CHANNELS: usize = u8::MAX as usize + 1;

    pub fn new(classes: Vec<ReliabilityClass>) -> anyhow::Result<Arc<ChannelSpec>> {
        if classes.is_empty() {
            return Err(anyhow!("a channel spec needs at least one channel"));
        }
        if classes.len() > Self::MAX_CHANNELS {
            return Err(anyhow!("a channel spec can have at most {} channels, was {}", Self::MAX_CHANNELS, classes.len()));
        }
        Ok(Arc::new(ChannelSpec { classes }))
    }

    pub fn class_of(&self, channel: u8) -> Option<ReliabilityClass> {
        self.classes.get(channel as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn channels(&self) -> impl Iterator<Item=u8> {
        // NB: new() ensures the number of channels fits
        (0..self.classes.len()).map(|c| c as u8)
    }
}
