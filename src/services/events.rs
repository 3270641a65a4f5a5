use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Buffered events per client before new ones are dropped.
const CLIENT_BUFFER: usize = 64;

/// Event pushed to a connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEvent {
    pub event: String,
    pub data: serde_json::Value,
}

/// Per-client push channels, keyed by client id (the requester id for jobs).
#[derive(Default)]
pub struct EventHub {
    clients: Mutex<HashMap<String, mpsc::Sender<ServerEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<ServerEvent>>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `client_id`, replacing any previous connection with that id.
    pub fn register(&self, client_id: &str) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        self.clients().insert(client_id.to_string(), tx);
        tracing::debug!(client_id = %client_id, "Event client registered");
        rx
    }

    /// Drop the registration for `client_id` if its receiver has gone away.
    /// A newer registration under the same id is left alone.
    pub fn release(&self, client_id: &str) {
        let mut clients = self.clients();
        if clients.get(client_id).is_some_and(|tx| tx.is_closed()) {
            clients.remove(client_id);
            tracing::debug!(client_id = %client_id, "Event client released");
        }
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.clients().contains_key(client_id)
    }

    /// Push an event. Returns whether a registered client accepted it.
    pub fn send_event(&self, client_id: &str, event: &str, data: serde_json::Value) -> bool {
        let mut clients = self.clients();
        let Some(tx) = clients.get(client_id) else {
            return false;
        };

        match tx.try_send(ServerEvent {
            event: event.to_string(),
            data,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(client_id = %client_id, event = %event, "Client buffer full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                clients.remove(client_id);
                false
            }
        }
    }
}
