use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, error, info, warn};
use tokio::time::Instant;

use ldpos_common::{
    block::{Block, BlockSignature},
    time::get_current_time_in_millis,
};

use crate::{
    core::{
        delegates::forger_for_timestamp,
        verify::{verify_block_signature, verify_forged_block},
    },
    dal::Dal,
    error::ChainError,
    network::EVENT_BLOCK_SIGNATURE,
    ChainModule,
};

impl<D: Dal> ChainModule<D> {
    // The per-slot state machine: catch up with the chain, wait for the
    // slot boundary, forge or receive the slot's block, collect delegate
    // co-signatures, then process. Errors are logged and the loop moves
    // on to the next slot.
    pub(crate) async fn run_block_processing_loop(self: &Arc<Self>) {
        info!("Starting the block processing loop");
        while self.is_active() {
            if let Err(err) = self.block_processing_iteration().await {
                error!("Block processing iteration failed: {}", err);
            }
        }
        info!("Stopped the block processing loop");
    }

    async fn block_processing_iteration(self: &Arc<Self>) -> Result<(), ChainError> {
        // CATCH_UP
        match self.catch_up().await {
            Ok((height, added)) if added > 0 => {
                info!("Caught up {} blocks to height {}", added, height);
                if self.config.auto_sync_forging_key_index {
                    self.sync_forging_key_indexes().await;
                }
            }
            Ok(_) => {}
            Err(err) => warn!("Catch-up failed: {}", err),
        }

        // WAIT_SLOT
        let Some(slot_timestamp) = self
            .clock
            .wait_until_next_block_time_slot(&self.is_active)
            .await
        else {
            return Ok(());
        };

        // per-slot state reset
        *self.active_block.write().await = None;
        self.received_signer_addresses.lock().await.clear();
        self.drain_verified_streams().await;

        let active_delegates = self.delegates.snapshot().await;
        let Some(assigned) = forger_for_timestamp(
            &active_delegates,
            self.config.forging_interval,
            slot_timestamp,
        ) else {
            debug!("No active delegates; skipping slot");
            return Ok(());
        };
        let assigned_address = assigned.address.clone();

        // FORGE_OR_RECEIVE
        let local_forger = self
            .forging_clients
            .iter()
            .find(|client| client.wallet_address() == assigned_address)
            .cloned();

        let (block, delegate_changed_keys) = if let Some(forger) = local_forger {
            self.sleep_cooperatively(self.config.forging_block_broadcast_delay)
                .await;
            if !self.is_active() {
                return Ok(());
            }
            let block = self.forge_block(forger.as_ref(), slot_timestamp).await?;
            // mirror the verification peers will apply before broadcast
            let last = self.last_processed_block().await;
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
            info!("Forged block {} for slot timestamp {}", block.id, slot_timestamp);
            if let Err(err) = self
                .network
                .emit(
                    &self.event_name(crate::network::EVENT_BLOCK),
                    serde_json::to_value(&block).expect("block serialization"),
                    None,
                )
                .await
            {
                warn!("Failed to broadcast the forged block: {}", err);
            }
            (block, verified.delegate_changed_keys)
        } else {
            let timeout =
                self.config.forging_block_broadcast_delay + self.config.propagation_timeout;
            match self.next_verified_block(slot_timestamp, timeout).await {
                Some(received) => received,
                None => {
                    debug!(
                        "No block for slot timestamp {} arrived within {}ms",
                        slot_timestamp, timeout
                    );
                    return Ok(());
                }
            }
        };

        *self.active_block.write().await = Some(block.clone());

        // COLLECT_SIGS
        let required = self
            .config
            .required_block_signature_count(active_delegates.len());
        let mut signatures = self.sign_with_local_delegates(&block, &active_delegates).await;
        if signatures.len() < required {
            let collected = self
                .collect_block_signatures(&block, required, signatures)
                .await;
            match collected {
                Some(complete) => signatures = complete,
                None => {
                    warn!(
                        "Skipping block {}: the signature quorum of {} was not reached",
                        block.id, required
                    );
                    return Ok(());
                }
            }
        }

        let mut signed_block = block;
        signed_block.signatures = signatures.into_values().collect();

        // PROCESS
        if self.meets_block_policy(&signed_block, delegate_changed_keys) {
            self.process_block(&signed_block, false).await?;
            *self.last_fully_signed_block_id.write().await = Some(signed_block.id.clone());
        } else {
            self.emit_skip_block(&signed_block);
        }
        Ok(())
    }

    // Every local forging delegate other than the forger contributes its
    // own co-signature: verified locally, fed to the collection, and
    // broadcast to the mesh
    async fn sign_with_local_delegates(
        self: &Arc<Self>,
        block: &Block,
        active_delegates: &[ldpos_common::account::Delegate],
    ) -> IndexMap<String, BlockSignature> {
        let mut signatures = IndexMap::new();
        if self.last_double_forged_timestamp.load(Ordering::SeqCst) == block.timestamp {
            warn!(
                "Refusing to sign any block for double-forged timestamp {}",
                block.timestamp
            );
            return signatures;
        }
        for client in &self.forging_clients {
            let address = client.wallet_address();
            if address == block.forger_address {
                continue;
            }
            if !active_delegates.iter().any(|delegate| delegate.address == address) {
                continue;
            }
            let signature = match client.sign_block(block).await {
                Ok(signature) => signature,
                Err(err) => {
                    warn!("Delegate {} failed to sign block {}: {}", address, block.id, err);
                    continue;
                }
            };
            if let Err(err) = verify_block_signature(
                self.dal.as_ref(),
                self.verifier.as_ref(),
                active_delegates,
                block,
                &signature,
            )
            .await
            {
                warn!("Discarding own invalid signature from {}: {}", address, err);
                continue;
            }
            self.received_signer_addresses
                .lock()
                .await
                .insert(address.to_string());
            signatures.insert(address.to_string(), signature.clone());
            self.propagate(
                EVENT_BLOCK_SIGNATURE,
                serde_json::to_value(&signature).expect("signature serialization"),
            );
        }
        signatures
    }

    // Await gossip co-signatures until the quorum is reached or the
    // collection window closes
    async fn collect_block_signatures(
        &self,
        block: &Block,
        required: usize,
        mut signatures: IndexMap<String, BlockSignature>,
    ) -> Option<IndexMap<String, BlockSignature>> {
        let window = self.config.forging_signature_broadcast_delay
            + self.config.propagation_timeout;
        let deadline = Instant::now() + Duration::from_millis(window);

        while signatures.len() < required {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let mut receiver = self.verified_signature_receiver.lock().await;
            tokio::select! {
                received = tokio::time::timeout(remaining, receiver.recv()) => match received {
                    Ok(Some(signature)) => {
                        if signature.block_id == block.id {
                            signatures.insert(signature.signer_address.clone(), signature);
                        }
                    }
                    Ok(None) => return None,
                    Err(_) => return None,
                },
                _ = self.wait_deactivated() => return None,
            }
        }
        Some(signatures)
    }

    // A block verified for an earlier slot is stale by the time the
    // loop looks again; keep only the current slot's block
    async fn next_verified_block(
        &self,
        slot_timestamp: u64,
        timeout_ms: u64,
    ) -> Option<(Block, bool)> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let mut receiver = self.verified_block_receiver.lock().await;
            tokio::select! {
                received = tokio::time::timeout(remaining, receiver.recv()) => match received {
                    Ok(Some((block, delegate_changed_keys))) => {
                        if block.timestamp == slot_timestamp {
                            return Some((block, delegate_changed_keys));
                        }
                        debug!("Discarding stale verified block {}", block.id);
                    }
                    Ok(None) => return None,
                    Err(_) => return None,
                },
                _ = self.wait_deactivated() => return None,
            }
        }
    }

    async fn drain_verified_streams(&self) {
        let mut blocks = self.verified_block_receiver.lock().await;
        while blocks.try_recv().is_ok() {}
        drop(blocks);
        let mut signatures = self.verified_signature_receiver.lock().await;
        while signatures.try_recv().is_ok() {}
    }

    async fn sleep_cooperatively(&self, millis: u64) {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {}
            _ = self.wait_deactivated() => {}
        }
    }
}
