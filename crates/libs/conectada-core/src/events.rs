use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::connectivity::Connectivity;

const EVENT_CAPACITY: usize = 64;

/// Client-wide events published over a broadcast channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum AppEvent {
    /// The server rejected the credential; the UI should return to login.
    SessionExpired,
    LoggedIn,
    LoggedOut,
    ActionQueued { id: u64 },
    DrainFinished { succeeded: usize, retained: usize, dead_lettered: usize },
    ConnectivityChanged { connectivity: Connectivity },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: AppEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
