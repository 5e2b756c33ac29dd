use std::sync::Arc;

use anyhow::anyhow;
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::substrate::peer_identity::PeerIdentity;
use crate::transport::message_handler::{MessageContext, MessageHandler};

/// Message types used by the session itself. They travel framed like application messages on the
///  control channel, and applications cannot register handlers for them.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(i16)]
pub enum ControlMessageType {
    Disconnect = 33,
    Ready = 35,
    SpawnRequest = 1002,
}

impl ControlMessageType {
    pub fn is_reserved(msg_type: i16) -> bool {
        ControlMessageType::try_from(msg_type).is_ok()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlMessage {
    /// "my higher-level routing is ready, you may address me", carrying the sender's identity
    Ready(PeerIdentity),
    /// "represent me in the shared world", carrying the sender's identity
    SpawnRequest(PeerIdentity),
    /// best-effort notification that the sender is leaving the session
    Disconnect,
}

impl ControlMessage {
    pub fn msg_type(&self) -> ControlMessageType {
        match self {
            ControlMessage::Ready(_) => ControlMessageType::Ready,
            ControlMessage::SpawnRequest(_) => ControlMessageType::SpawnRequest,
            ControlMessage::Disconnect => ControlMessageType::Disconnect,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            ControlMessage::Ready(identity) |
            ControlMessage::SpawnRequest(identity) => buf.put_slice(identity.to_text().as_bytes()),
            ControlMessage::Disconnect => {}
        }
    }

    pub fn deser(msg_type: i16, buf: &[u8]) -> anyhow::Result<ControlMessage> {
        let msg_type = ControlMessageType::try_from(msg_type)
            .map_err(|_| anyhow!("{} is not a control message type", msg_type))?;

        match msg_type {
            ControlMessageType::Ready => Ok(ControlMessage::Ready(PeerIdentity::try_from_text(buf)?)),
            ControlMessageType::SpawnRequest => Ok(ControlMessage::SpawnRequest(PeerIdentity::try_from_text(buf)?)),
            ControlMessageType::Disconnect => Ok(ControlMessage::Disconnect),
        }
    }
}

/// Receives framed control messages and forwards them to the session, which handles them as part
///  of its tick
pub struct ControlMessageModule {
    channel: mpsc::UnboundedSender<(PeerIdentity, ControlMessage)>,
}

impl ControlMessageModule {
    pub fn new(channel: mpsc::UnboundedSender<(PeerIdentity, ControlMessage)>) -> Arc<ControlMessageModule> {
        Arc::new(ControlMessageModule {
            channel,
        })
    }

    fn _on_message(&self, ctx: &MessageContext, buf: &[u8]) -> anyhow::Result<()> {
        let msg = ControlMessage::deser(ctx.msg_type, buf)?;
        trace!("received {:?} from {:?}", msg, ctx.from);
        self.channel.send((ctx.from, msg))?;
        Ok(())
    }
}

impl MessageHandler for ControlMessageModule {
    fn on_message(&self, ctx: &MessageContext, payload: &[u8]) {
        if let Err(e) = self._on_message(ctx, payload) {
            error!("error deserializing control message from {:?}: {}", ctx.from, e);
        }
    }
}
