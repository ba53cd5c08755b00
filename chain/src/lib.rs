pub mod config;
pub mod core;
pub mod dal;
pub mod error;
pub mod events;
pub mod network;
pub mod rpc;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::ChainConfig;
pub use error::ChainError;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{error, info, warn};
use serde_json::json;
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};

use ldpos_common::{
    block::{Block, BlockSignature},
    crypto::{CryptoClient, CryptoVerifier},
    genesis::Genesis,
    time::get_current_time_in_millis,
};

use crate::{
    core::{clock::SlotClock, delegates::ActiveDelegates, mempool::Mempool},
    dal::Dal,
    events::{EventBus, ModuleEvent},
    network::NetworkChannel,
};

// The chain module: owns the in-memory caches, drives the block-slot
// loop, and mediates between the DAL, the crypto clients and the peer
// mesh. One instance per node process.
pub struct ChainModule<D: Dal> {
    pub(crate) config: Arc<ChainConfig>,
    pub(crate) genesis_id: String,
    pub(crate) dal: Arc<D>,
    pub(crate) network: Arc<dyn NetworkChannel>,
    pub(crate) verifier: Arc<dyn CryptoVerifier>,
    // one connected client per local forging credential
    pub(crate) forging_clients: Vec<Arc<dyn CryptoClient>>,
    pub(crate) mempool: Mempool,
    pub(crate) delegates: ActiveDelegates,
    pub(crate) clock: SlotClock,
    pub(crate) events: EventBus,

    pub(crate) last_processed_block: RwLock<Block>,
    pub(crate) last_fully_signed_block_id: RwLock<Option<String>>,
    // slot timestamp of the most recently observed double-forge
    pub(crate) last_double_forged_timestamp: AtomicU64,
    pub(crate) active_block: RwLock<Option<Block>>,
    pub(crate) received_signer_addresses: Mutex<HashSet<String>>,

    pub(crate) verified_block_sender: mpsc::UnboundedSender<(Block, bool)>,
    pub(crate) verified_block_receiver: Mutex<mpsc::UnboundedReceiver<(Block, bool)>>,
    pub(crate) verified_signature_sender: mpsc::UnboundedSender<BlockSignature>,
    pub(crate) verified_signature_receiver: Mutex<mpsc::UnboundedReceiver<BlockSignature>>,

    pub(crate) is_active: AtomicBool,
    slot_loop_task: Mutex<Option<JoinHandle<()>>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: Dal> ChainModule<D> {
    // Build the module without starting any background work. The slot
    // loop, gossip handlers and expiry task start with `start`; `load`
    // does both.
    pub async fn create(
        dal: Arc<D>,
        network: Arc<dyn NetworkChannel>,
        verifier: Arc<dyn CryptoVerifier>,
        forging_clients: Vec<Arc<dyn CryptoClient>>,
        config: ChainConfig,
        genesis: Genesis,
    ) -> Result<Arc<Self>, ChainError> {
        config.validate()?;
        if genesis.network_symbol != config.network_symbol {
            return Err(ChainError::Config(format!(
                "genesis network symbol {} did not match the configured {}",
                genesis.network_symbol, config.network_symbol
            )));
        }

        dal.init(&genesis).await?;
        let genesis_id = genesis.id();

        // resume from the persisted chain tip if there is one
        let max_height = dal.get_max_block_height().await?;
        let last_processed_block = if max_height > 0 {
            dal.get_block_at_height(max_height).await?
        } else {
            Block::genesis_tip(genesis_id.clone())
        };
        info!(
            "Loading chain module at height {} with {} forging credentials",
            last_processed_block.height,
            forging_clients.len()
        );

        let config = Arc::new(config);
        let (verified_block_sender, verified_block_receiver) = mpsc::unbounded_channel();
        let (verified_signature_sender, verified_signature_receiver) = mpsc::unbounded_channel();

        let module = Arc::new(ChainModule {
            mempool: Mempool::new(config.clone(), verifier.clone()),
            delegates: ActiveDelegates::new(config.forger_count, config.forging_interval),
            clock: SlotClock::new(config.forging_interval, config.time_poll_interval),
            events: EventBus::new(256),
            config,
            genesis_id,
            dal,
            network,
            verifier,
            forging_clients,
            last_processed_block: RwLock::new(last_processed_block),
            last_fully_signed_block_id: RwLock::new(None),
            last_double_forged_timestamp: AtomicU64::new(u64::MAX),
            active_block: RwLock::new(None),
            received_signer_addresses: Mutex::new(HashSet::new()),
            verified_block_sender,
            verified_block_receiver: Mutex::new(verified_block_receiver),
            verified_signature_sender,
            verified_signature_receiver: Mutex::new(verified_signature_receiver),
            is_active: AtomicBool::new(true),
            slot_loop_task: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
        });

        module.delegates.refresh(module.dal.as_ref()).await?;
        Ok(module)
    }

    pub async fn load(
        dal: Arc<D>,
        network: Arc<dyn NetworkChannel>,
        verifier: Arc<dyn CryptoVerifier>,
        forging_clients: Vec<Arc<dyn CryptoClient>>,
        config: ChainConfig,
        genesis: Genesis,
    ) -> Result<Arc<Self>, ChainError> {
        let module =
            Self::create(dal, network, verifier, forging_clients, config, genesis).await?;
        module.start().await;
        module.events.publish(ModuleEvent::Bootstrap);
        Ok(module)
    }

    // Spawn the gossip handlers, the pending-expiry task and the
    // block-slot loop
    pub async fn start(self: &Arc<Self>) {
        if let Err(err) = self.advertise_module_state().await {
            warn!("Failed to advertise module state: {}", err);
        }

        let mut background = self.background_tasks.lock().await;
        background.extend(self.spawn_gossip_handlers());
        background.push(tokio::spawn(self.clone().run_expiry_task()));

        let module = self.clone();
        *self.slot_loop_task.lock().await = Some(tokio::spawn(async move {
            module.run_block_processing_loop().await;
        }));
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    // Resolves once the module is deactivated; used as the escape hatch
    // of every long wait so unload falls through at the next poll
    pub(crate) async fn wait_deactivated(&self) {
        while self.is_active() {
            tokio::time::sleep(Duration::from_millis(self.config.time_poll_interval)).await;
        }
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ModuleEvent> {
        self.events.subscribe()
    }

    pub async fn last_processed_block(&self) -> Block {
        self.last_processed_block.read().await.clone()
    }

    pub fn dal(&self) -> &Arc<D> {
        &self.dal
    }

    // Id of the persisted genesis tip the first forged block links to
    pub fn genesis_id(&self) -> &str {
        &self.genesis_id
    }

    pub async fn last_fully_signed_block_id(&self) -> Option<String> {
        self.last_fully_signed_block_id.read().await.clone()
    }

    // Capability flags, e.g. that this node can serve 12 signatures per
    // block to catching-up peers
    pub(crate) async fn advertise_module_state(&self) -> Result<(), ChainError> {
        let mut state = serde_json::Map::new();
        state.insert(self.config.block_signatures_capability(), json!(true));
        state.insert(
            "providesAllBlockSignatures".to_string(),
            json!(self.config.block_signatures_to_provide >= self.config.forger_count),
        );
        state.insert(
            "providesMostBlockSignatures".to_string(),
            json!(self.config.block_signatures_to_provide * 2 >= self.config.forger_count),
        );
        self.network
            .update_module_state(serde_json::Value::Object(state))
            .await?;
        Ok(())
    }

    async fn run_expiry_task(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.pending_transaction_expiry_check_interval,
        ));
        // the first tick fires immediately; skip it
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.is_active() {
                        break;
                    }
                    self.mempool.expire(get_current_time_in_millis()).await;
                }
                _ = self.wait_deactivated() => break,
            }
        }
    }

    // Deactivate, wait for the slot loop to observe it, stop the
    // auxiliary tasks and tear down the DAL
    pub async fn unload(&self) -> Result<(), ChainError> {
        info!("Unloading chain module");
        self.is_active.store(false, Ordering::SeqCst);

        if let Some(task) = self.slot_loop_task.lock().await.take() {
            if let Err(err) = task.await {
                error!("Block processing loop ended abnormally: {}", err);
            }
        }
        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.dal.destroy().await?;
        Ok(())
    }
}
