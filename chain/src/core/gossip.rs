use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

use ldpos_common::{
    block::{Block, BlockSignature},
    crypto::sha256_hex,
    time::get_current_time_in_millis,
    transaction::Transaction,
};

use crate::{
    config::PropagationMode,
    core::verify::{verify_block_signature, verify_forged_block},
    dal::Dal,
    error::ChainError,
    events::ModuleEvent,
    network::{EVENT_BLOCK, EVENT_BLOCK_SIGNATURE, EVENT_TRANSACTION},
    ChainModule,
};

impl<D: Dal> ChainModule<D> {
    pub(crate) fn event_name(&self, kind: &str) -> String {
        format!("{}:{}", self.config.module_alias, kind)
    }

    // Ingest loops for the three peer event streams. Handler errors are
    // logged and swallowed: a malformed or hostile message must never
    // stall gossip.
    pub(crate) fn spawn_gossip_handlers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let transaction_rx = self.network.subscribe(&self.event_name(EVENT_TRANSACTION));
        let block_rx = self.network.subscribe(&self.event_name(EVENT_BLOCK));
        let signature_rx = self
            .network
            .subscribe(&self.event_name(EVENT_BLOCK_SIGNATURE));

        vec![
            tokio::spawn(self.clone().run_gossip_loop(
                transaction_rx,
                |module, data| async move {
                    module.handle_transaction_event(data).await
                },
            )),
            tokio::spawn(self.clone().run_gossip_loop(block_rx, |module, data| async move {
                module.handle_block_event(data).await
            })),
            tokio::spawn(self.clone().run_gossip_loop(
                signature_rx,
                |module, data| async move {
                    module.handle_block_signature_event(data).await
                },
            )),
        ]
    }

    async fn run_gossip_loop<F, Fut>(
        self: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<Value>,
        handler: F,
    ) where
        F: Fn(Arc<Self>, Value) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), ChainError>> + Send,
    {
        loop {
            tokio::select! {
                maybe = receiver.recv() => match maybe {
                    Some(data) => {
                        if let Err(err) = handler(self.clone(), data).await {
                            debug!("Dropped peer message: {}", err);
                        }
                    }
                    None => break,
                },
                _ = self.wait_deactivated() => break,
            }
        }
    }

    // Transaction gossip: parse, authenticate into the mempool, then
    // re-broadcast with the usual jitter
    pub(crate) async fn handle_transaction_event(
        self: Arc<Self>,
        data: Value,
    ) -> Result<(), ChainError> {
        let transaction: Transaction = serde_json::from_value(data.clone()).map_err(|err| {
            ChainError::invalid_transaction("", format!("malformed transaction event: {}", err))
        })?;
        self.mempool
            .add_transaction(
                self.dal.as_ref(),
                transaction.clone(),
                get_current_time_in_millis(),
            )
            .await?;
        self.events.publish(ModuleEvent::Transaction { transaction });
        self.propagate(EVENT_TRANSACTION, data);
        Ok(())
    }

    // Block gossip: double-forge defence, full verification, fetching
    // of any referenced pending transactions this node lacks, and the
    // signature-hash cross-check before the block reaches the slot loop
    pub(crate) async fn handle_block_event(self: Arc<Self>, data: Value) -> Result<(), ChainError> {
        let block: Block = serde_json::from_value(data.clone()).map_err(|err| {
            ChainError::invalid_block("", format!("malformed block event: {}", err))
        })?;

        let last = self.last_processed_block().await;
        let conflicting = {
            let active = self.active_block.read().await;
            match active.as_ref() {
                Some(active) => active.timestamp == block.timestamp && active.id != block.id,
                None => last.timestamp == block.timestamp && last.id != block.id,
            }
        };
        if conflicting {
            let previous = self
                .last_double_forged_timestamp
                .swap(block.timestamp, Ordering::SeqCst);
            if previous != block.timestamp {
                // propagate exactly once so peers can detect it too
                warn!(
                    "Detected a double-forged block {} for timestamp {}",
                    block.id, block.timestamp
                );
                self.propagate(EVENT_BLOCK, data);
            }
            return Ok(());
        }

        let active_delegates = self.delegates.snapshot().await;
        let verified = verify_forged_block(
            self.dal.as_ref(),
            self.verifier.as_ref(),
            &self.config,
            &active_delegates,
            &block,
            &last,
            get_current_time_in_millis(),
        )
        .await?;

        // the block carries signature hashes only; make sure this node
        // holds the full signed form of every referenced transaction
        for transaction in &block.transactions {
            if !self.mempool.has_pending(&transaction.id).await {
                self.fetch_pending_transaction(&transaction.id).await?;
            }
        }
        for transaction in &block.transactions {
            self.check_signature_hashes(transaction).await?;
        }

        let _ = self
            .verified_block_sender
            .send((block, verified.delegate_changed_keys));
        self.propagate(EVENT_BLOCK, data);
        Ok(())
    }

    // Block signature gossip: authenticate against the active block,
    // dedupe per signer, hand to the collecting slot loop
    pub(crate) async fn handle_block_signature_event(
        self: Arc<Self>,
        data: Value,
    ) -> Result<(), ChainError> {
        let signature: BlockSignature = serde_json::from_value(data.clone()).map_err(|err| {
            ChainError::InvalidBlockSignature {
                signer_address: String::new(),
                reason: format!("malformed block signature event: {}", err),
            }
        })?;

        let Some(block) = self.active_block.read().await.clone() else {
            return Err(ChainError::InvalidBlockSignature {
                signer_address: signature.signer_address,
                reason: "there was no active block to sign".to_string(),
            });
        };
        let active_delegates = self.delegates.snapshot().await;
        verify_block_signature(
            self.dal.as_ref(),
            self.verifier.as_ref(),
            &active_delegates,
            &block,
            &signature,
        )
        .await?;

        {
            let mut seen = self.received_signer_addresses.lock().await;
            if !seen.insert(signature.signer_address.clone()) {
                return Ok(());
            }
        }
        let _ = self.verified_signature_sender.send(signature);
        self.propagate(EVENT_BLOCK_SIGNATURE, data);
        Ok(())
    }

    // Retry a pending-transaction fetch against the mesh until the
    // failure budget is spent
    async fn fetch_pending_transaction(&self, id: &str) -> Result<(), ChainError> {
        let procedure = format!("{}:getSignedPendingTransaction", self.config.module_alias);
        let mut failures = 0;
        loop {
            let result = self
                .network
                .request(&procedure, serde_json::json!({ "transactionId": id }), None)
                .await;
            let outcome = match result {
                Ok(value) => match serde_json::from_value::<Transaction>(value) {
                    Ok(transaction) if transaction.id == id => self
                        .mempool
                        .add_transaction(
                            self.dal.as_ref(),
                            transaction,
                            get_current_time_in_millis(),
                        )
                        .await,
                    Ok(transaction) => Err(ChainError::invalid_transaction(
                        &transaction.id,
                        format!("peer answered a fetch for {}", id),
                    )),
                    Err(err) => Err(ChainError::invalid_transaction(
                        id,
                        format!("malformed fetched transaction: {}", err),
                    )),
                },
                Err(err) => Err(err.into()),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(err) => {
                    failures += 1;
                    debug!("Fetching pending transaction {} failed: {}", id, err);
                    if failures >= self.config.max_consecutive_transaction_fetch_failures {
                        return Err(err);
                    }
                }
            }
        }
    }

    // The hashes inside a simplified in-block transaction must match
    // the full signatures this node holds for it
    async fn check_signature_hashes(&self, simplified: &Transaction) -> Result<(), ChainError> {
        let pending = self
            .mempool
            .get_pending(&simplified.id)
            .await
            .ok_or_else(|| ChainError::PendingTransactionDidNotExist(simplified.id.clone()))?;

        if let Some(signature) = &pending.sender_signature {
            if simplified.sender_signature_hash.as_deref()
                != Some(sha256_hex(signature.as_bytes()).as_str())
            {
                return Err(ChainError::invalid_transaction(
                    &simplified.id,
                    "senderSignatureHash did not match the known signature",
                ));
            }
        }
        for packet in &simplified.signatures {
            let known = pending
                .signatures
                .iter()
                .find(|candidate| candidate.signer_address == packet.signer_address)
                .and_then(|candidate| candidate.signature.as_deref())
                .ok_or_else(|| {
                    ChainError::invalid_transaction(
                        &simplified.id,
                        format!("no known signature from {}", packet.signer_address),
                    )
                })?;
            if packet.signature_hash.as_deref() != Some(sha256_hex(known.as_bytes()).as_str()) {
                return Err(ChainError::invalid_transaction(
                    &simplified.id,
                    format!("signatureHash of {} did not match", packet.signer_address),
                ));
            }
        }
        Ok(())
    }

    // Re-broadcast after a random delay so rebroadcasts across the mesh
    // desynchronise instead of bursting
    pub(crate) fn propagate(self: &Arc<Self>, kind: &str, data: Value) {
        if self.config.propagation_mode == PropagationMode::None {
            return;
        }
        let module = self.clone();
        let event = self.event_name(kind);
        let delay = if self.config.propagation_randomness > 0 {
            rand::thread_rng().gen_range(0..self.config.propagation_randomness)
        } else {
            0
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if !module.is_active() {
                return;
            }
            if let Err(err) = module.network.emit(&event, data, None).await {
                warn!("Failed to propagate {} event: {}", event, err);
            }
        });
    }
}
