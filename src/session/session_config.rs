use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;

use crate::substrate::peer_identity::PeerIdentity;
use crate::transport::channel_spec::ChannelSpec;
use crate::transport::framing::FRAME_HEADER_LEN;

#[derive(Debug)]
pub struct SessionConfig {
    /// capacity of a group created by this peer, the host included
    pub max_members: usize,

    /// must be identical for all peers of a session
    pub channel_spec: Arc<ChannelSpec>,
    /// channel for session control messages - must be a reliable channel
    pub control_channel: u8,

    /// how long a joiner waits for the host to acknowledge its session request
    pub ack_timeout: Duration,
    /// how long the host waits for an accepted peer's readiness message
    pub readiness_timeout: Duration,
    pub tick_interval: Duration,

    /// outbound batches are sent before they grow beyond this size
    pub max_packet_size: usize,
    /// upper bound for the number of packets read per channel in a single tick
    pub max_packets_per_tick: usize,

    /// send a spawn request to the host after the handshake
    pub request_spawn_on_connect: bool,
    /// invite as soon as a newly created group's server is ready
    pub invite_on_start: bool,
    /// peer to invite directly instead of opening the directory's invite dialog
    pub auto_invite: Option<PeerIdentity>,
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig {
            max_members: 4,
            channel_spec: Arc::new(ChannelSpec::default()),
            control_channel: 0,
            ack_timeout: Duration::from_secs(10),
            readiness_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(16),
            max_packet_size: 1200,
            max_packets_per_tick: 256,
            request_spawn_on_connect: true,
            invite_on_start: false,
            auto_invite: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_members == 0 {
            return Err(anyhow!("max_members must be at least 1"));
        }
        if self.channel_spec.is_empty() || self.channel_spec.len() > ChannelSpec::MAX_CHANNELS {
            return Err(anyhow!("channel spec must have between 1 and {} channels, has {}", ChannelSpec::MAX_CHANNELS, self.channel_spec.len()));
        }
        match self.channel_spec.class_of(self.control_channel) {
            None => return Err(anyhow!("control channel {} is not configured", self.control_channel)),
            Some(class) if class.is_unreliable() => return Err(anyhow!("control channel {} is unreliable ({:?})", self.control_channel, class)),
            Some(_) => {}
        }
        if self.max_packet_size <= FRAME_HEADER_LEN {
            return Err(anyhow!("max_packet_size must leave room for a frame, was {}", self.max_packet_size));
        }
        if self.max_packets_per_tick == 0 {
            return Err(anyhow!("max_packets_per_tick must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(anyhow!("tick_interval must not be zero"));
        }
        Ok(())
    }
}
