use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::error::SessionError;
use crate::substrate::peer_identity::PeerIdentity;
use crate::transport::connection::ConnectionId;

/// Everything a handler gets to know about a received message apart from its payload
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MessageContext {
    /// the remote identity of the connection the message arrived on. For the loopback connection,
    ///  this is the local identity.
    pub from: PeerIdentity,
    pub connection_id: ConnectionId,
    pub channel: u8,
    pub msg_type: i16,
}

/// Application code plugs in per-message-type handlers. A handler is called synchronously from
///  the tick that decodes the message, so it must not block; non-trivial work should be handed
///  off, e.g. through a channel.
///
/// The payload is a view of exactly the message's bytes: a handler cannot read into the next
///  message in the same packet.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, ctx: &MessageContext, payload: &[u8]);
}

impl<F> MessageHandler for F
where F: Fn(&MessageContext, &[u8]) + Send + Sync + 'static
{
    fn on_message(&self, ctx: &MessageContext, payload: &[u8]) {
        self(ctx, payload)
    }
}

/// The message handlers of a session, one per message type.
///
/// Control handlers are special in that their messages are delivered on connections that are not
///  ready for application traffic yet, see [crate::transport::connection::LogicalConnection::receive].
#[derive(Default)]
pub struct MessageHandlers {
    handlers: FxHashMap<i16, Arc<dyn MessageHandler>>,
    control_types: FxHashSet<i16>,
}

impl Debug for MessageHandlers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut types = self.handlers.keys().collect::<Vec<_>>();
        types.sort();
        write!(f, "MessageHandlers{:?}", types)
    }
}

impl MessageHandlers {
    pub fn new() -> MessageHandlers {
        Default::default()
    }

    pub fn register(&mut self, msg_type: i16, handler: Arc<dyn MessageHandler>) -> Result<(), SessionError> {
        if self.handlers.contains_key(&msg_type) {
            return Err(SessionError::DuplicateHandler(msg_type));
        }
        self.handlers.insert(msg_type, handler);
        Ok(())
    }

    /// Registers the handler for a message type that is part of establishing a connection
    pub fn register_control(&mut self, msg_type: i16, handler: Arc<dyn MessageHandler>) -> Result<(), SessionError> {
        self.register(msg_type, handler)?;
        self.control_types.insert(msg_type);
        Ok(())
    }

    /// returns `true` if there was a handler for the message type
    pub fn deregister(&mut self, msg_type: i16) -> bool {
        self.control_types.remove(&msg_type);
        self.handlers.remove(&msg_type).is_some()
    }

    pub fn is_control(&self, msg_type: i16) -> bool {
        self.control_types.contains(&msg_type)
    }

    pub fn is_registered(&self, msg_type: i16) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    pub fn dispatch(&self, ctx: &MessageContext, payload: &[u8]) {
        match self.handlers.get(&ctx.msg_type) {
            Some(handler) => {
                trace!("dispatching message type {} from {:?} ({} bytes)", ctx.msg_type, ctx.from, payload.len());
                handler.on_message(ctx, payload);
            }
            None => {
                debug!("no handler for message type {} from {:?} - dropping message", ctx.msg_type, ctx.from);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;
    use super::*;
    use crate::test_util::identity::test_identity;

    fn ctx(msg_type: i16) -> MessageContext {
        MessageContext {
            from: test_identity(2),
            connection_id: ConnectionId(1),
            channel: 0,
            msg_type,
        }
    }

    #[test]
    fn test_register_dispatch() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        let mut handlers = MessageHandlers::new();
        handlers.register(100, Arc::new(move |ctx: &MessageContext, payload: &[u8]| {
            received_clone.lock().unwrap().push((ctx.msg_type, payload.to_vec()));
        })).unwrap();

        handlers.dispatch(&ctx(100), b"abc");
        handlers.dispatch(&ctx(101), b"ignored");
        handlers.dispatch(&ctx(100), b"");

        assert_eq!(*received.lock().unwrap(), vec![(100, b"abc".to_vec()), (100, vec![])]);
    }

    #[test]
    fn test_register_duplicate() {
        let mut handlers = MessageHandlers::new();
        handlers.register(7, Arc::new(|_: &MessageContext, _: &[u8]| {})).unwrap();
        assert_eq!(
            handlers.register(7, Arc::new(|_: &MessageContext, _: &[u8]| {})),
            Err(SessionError::DuplicateHandler(7)),
        );

        assert!(handlers.is_registered(7));
        assert!(handlers.deregister(7));
        assert!(!handlers.deregister(7));
        assert!(!handlers.is_registered(7));
        assert!(handlers.register(7, Arc::new(|_: &MessageContext, _: &[u8]| {})).is_ok());
    }

    #[test]
    fn test_register_control() {
        let mut handlers = MessageHandlers::new();
        handlers.register(7, Arc::new(|_: &MessageContext, _: &[u8]| {})).unwrap();
        handlers.register_control(35, Arc::new(|_: &MessageContext, _: &[u8]| {})).unwrap();
        assert_eq!(
            handlers.register_control(7, Arc::new(|_: &MessageContext, _: &[u8]| {})),
            Err(SessionError::DuplicateHandler(7)),
        );

        assert!(handlers.is_control(35));
        assert!(!handlers.is_control(7));
        assert!(handlers.deregister(35));
        assert!(!handlers.is_control(35));
    }
}
