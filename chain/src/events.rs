use serde::Serialize;
use tokio::sync::broadcast;

use ldpos_common::{block::Block, transaction::Transaction};

// Events published to other modules of the application
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChainChange {
    AddBlock { block: Block },
    SkipBlock { block: Block },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ModuleEvent {
    Bootstrap,
    ChainChanges { change: ChainChange },
    Transaction { transaction: Transaction },
}

// Fan-out to in-process listeners. Lagging receivers lose the oldest
// events rather than blocking the chain.
pub struct EventBus {
    sender: broadcast::Sender<ModuleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModuleEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ModuleEvent) {
        // delivery is best-effort; no listeners is fine
        let _ = self.sender.send(event);
    }
}
