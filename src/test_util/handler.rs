use std::sync::Mutex;

use crate::transport::message_handler::{MessageContext, MessageHandler};

/// A [MessageHandler] that records everything it receives
#[derive(Debug, Default)]
pub struct TrackingMessageHandler {
    tracker: Mutex<Vec<(MessageContext, Vec<u8>)>>,
}
impl TrackingMessageHandler {
    pub fn new() -> TrackingMessageHandler {
        Default::default()
    }

    /// all messages received so far, in the order of their arrival
    pub fn received(&self) -> Vec<(MessageContext, Vec<u8>)> {
        self.tracker.lock().unwrap().clone()
    }
}

impl MessageHandler for TrackingMessageHandler {
    fn on_message(&self, ctx: &MessageContext, payload: &[u8]) {
        self.tracker.lock().unwrap().push((*ctx, payload.to_vec()));
    }
}
