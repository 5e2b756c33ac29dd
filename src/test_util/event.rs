use tokio::sync::broadcast;

use crate::session::session_events::SessionEvent;

/// All events that were sent so far and were not received yet
pub fn drain_events(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut result = Vec::new();
    while let Ok(evt) = events.try_recv() {
        result.push(evt);
    }
    result
}

pub fn has_event(events: &[SessionEvent], expected: &SessionEvent) -> bool {
    events.iter().any(|e| e == expected)
}
