use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Peer request {procedure} failed: {reason}")]
    RequestFailed { procedure: String, reason: String },

    #[error("Peer request {0} timed out")]
    Timeout(String),

    #[error("Peer response to {procedure} was malformed: {reason}")]
    InvalidResponse { procedure: String, reason: String },
}

// Gossip event names, namespaced by the module alias on the wire
pub const EVENT_BLOCK: &str = "block";
pub const EVENT_BLOCK_SIGNATURE: &str = "blockSignature";
pub const EVENT_TRANSACTION: &str = "transaction";

// The peer mesh as the module sees it: RPC against a sampled peer,
// broadcast with an optional fan-out limit, and inbound event streams.
// Transport, discovery and encryption all live behind this seam.
#[async_trait]
pub trait NetworkChannel: Send + Sync + 'static {
    // Invoke a procedure against one peer. When a capability is given,
    // the request is routed to a peer advertising that flag (e.g.
    // "bsi12" for nodes that store 12 signatures per block).
    async fn request(
        &self,
        procedure: &str,
        data: Value,
        capability: Option<&str>,
    ) -> Result<Value, NetworkError>;

    // Publish an event to up to peer_limit peers (all when None)
    async fn emit(
        &self,
        event: &str,
        data: Value,
        peer_limit: Option<usize>,
    ) -> Result<(), NetworkError>;

    // Inbound stream of peer events of the given type
    fn subscribe(&self, event: &str) -> mpsc::UnboundedReceiver<Value>;

    // Advertise module capability flags to the mesh
    async fn update_module_state(&self, state: Value) -> Result<(), NetworkError>;
}

// Scriptable in-memory channel for tests and local simulation: queued
// responses per procedure, captured emits, and hand-fed event streams.
#[derive(Default)]
pub struct MemoryNetwork {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, String>>>>,
    emitted: Mutex<Vec<(String, Value)>>,
    module_state: Mutex<Option<Value>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork::default()
    }

    pub async fn queue_response(&self, procedure: &str, response: Value) {
        self.responses
            .lock()
            .await
            .entry(procedure.to_string())
            .or_default()
            .push_back(Ok(response));
    }

    pub async fn queue_failure(&self, procedure: &str, reason: &str) {
        self.responses
            .lock()
            .await
            .entry(procedure.to_string())
            .or_default()
            .push_back(Err(reason.to_string()));
    }

    pub async fn emitted_events(&self) -> Vec<(String, Value)> {
        self.emitted.lock().await.clone()
    }

    pub async fn advertised_state(&self) -> Option<Value> {
        self.module_state.lock().await.clone()
    }

    // Feed an inbound peer event to every subscriber of its type
    pub async fn inject_event(&self, event: &str, data: Value) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(senders) = subscribers.get_mut(event) {
            senders.retain(|sender| sender.send(data.clone()).is_ok());
        }
    }
}

#[async_trait]
impl NetworkChannel for MemoryNetwork {
    async fn request(
        &self,
        procedure: &str,
        _data: Value,
        _capability: Option<&str>,
    ) -> Result<Value, NetworkError> {
        let mut responses = self.responses.lock().await;
        match responses.get_mut(procedure).and_then(VecDeque::pop_front) {
            Some(Ok(value)) => Ok(value),
            Some(Err(reason)) => Err(NetworkError::RequestFailed {
                procedure: procedure.to_string(),
                reason,
            }),
            None => Err(NetworkError::RequestFailed {
                procedure: procedure.to_string(),
                reason: "no peer available".to_string(),
            }),
        }
    }

    async fn emit(
        &self,
        event: &str,
        data: Value,
        _peer_limit: Option<usize>,
    ) -> Result<(), NetworkError> {
        self.emitted.lock().await.push((event.to_string(), data));
        Ok(())
    }

    fn subscribe(&self, event: &str) -> mpsc::UnboundedReceiver<Value> {
        let (sender, receiver) = mpsc::unbounded_channel();
        // blocking_lock is unavailable on the current-thread runtime, so
        // register through a try_lock that cannot contend in practice
        if let Ok(mut subscribers) = self.subscribers.try_lock() {
            subscribers.entry(event.to_string()).or_default().push(sender);
        }
        receiver
    }

    async fn update_module_state(&self, state: Value) -> Result<(), NetworkError> {
        *self.module_state.lock().await = Some(state);
        Ok(())
    }
}
