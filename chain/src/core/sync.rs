use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use serde_json::{json, Value};

use ldpos_common::{
    account::Delegate,
    block::Block,
    crypto::KeyType,
    time::get_current_time_in_millis,
};

use crate::{
    core::verify::{verify_block_signature, verify_forged_block},
    dal::Dal,
    error::ChainError,
    ChainModule,
};

impl<D: Dal> ChainModule<D> {
    // Fetch batched signed blocks from peers and replay them until the
    // local tip stops lagging. Returns the final height and how many
    // blocks were added; verification failures abort and return the
    // progress made so far.
    pub(crate) async fn catch_up(&self) -> Result<(u64, usize), ChainError> {
        let mut added = 0usize;
        let mut failures = 0usize;
        let mut end_confirmations = 0usize;
        let procedure = format!("{}:getSignedBlocksFromHeight", self.config.module_alias);
        let capability = self.config.block_signatures_capability();

        loop {
            if !self.is_active() {
                break;
            }
            let last = self.last_processed_block().await;
            let response = self
                .network
                .request(
                    &procedure,
                    json!({
                        "height": last.height + 1,
                        "limit": self.config.fetch_block_limit,
                    }),
                    Some(&capability),
                )
                .await;

            let blocks: Vec<Block> = match response {
                Ok(value) => match Self::parse_block_batch(value, self.config.fetch_block_limit) {
                    Some(blocks) => blocks,
                    None => {
                        failures += 1;
                        if failures >= self.config.max_consecutive_block_fetch_failures {
                            warn!("Aborting catch-up after {} malformed block batches", failures);
                            return Ok((last.height, added));
                        }
                        self.fetch_pause().await;
                        continue;
                    }
                },
                Err(err) => {
                    debug!("Block fetch failed: {}", err);
                    failures += 1;
                    if failures >= self.config.max_consecutive_block_fetch_failures {
                        return Ok((last.height, added));
                    }
                    self.fetch_pause().await;
                    continue;
                }
            };

            if blocks.is_empty() {
                // peers agree there is nothing above our tip
                end_confirmations += 1;
                if end_confirmations >= self.config.fetch_block_end_confirmations {
                    break;
                }
                self.fetch_pause().await;
                continue;
            }
            end_confirmations = 0;

            if !Self::batch_links_to(&last, &blocks) {
                debug!("Discarding block batch with broken chain links");
                failures += 1;
                if failures >= self.config.max_consecutive_block_fetch_failures {
                    return Ok((last.height, added));
                }
                self.fetch_pause().await;
                continue;
            }

            // sampled consensus on the batch tip before replaying it
            let batch_tip = &blocks[blocks.len() - 1];
            let confirmations = self.sample_block_consensus(&batch_tip.id).await;
            let required = (self.config.catch_up_consensus_poll_count as f64
                * self.config.catch_up_consensus_min_ratio)
                .ceil() as usize;
            if confirmations < required {
                info!(
                    "Discarding block batch: only {} of {} sampled peers confirmed {}",
                    confirmations, self.config.catch_up_consensus_poll_count, batch_tip.id
                );
                return Ok((last.height, added));
            }

            for block in &blocks {
                let tip = self.last_processed_block().await;
                let active_delegates = self.delegates.snapshot().await;
                let now = get_current_time_in_millis();
                let verified = match verify_forged_block(
                    self.dal.as_ref(),
                    self.verifier.as_ref(),
                    &self.config,
                    &active_delegates,
                    block,
                    &tip,
                    now,
                )
                .await
                {
                    Ok(verified) => verified,
                    Err(err) => {
                        warn!("Aborting catch-up: block {} failed verification: {}", block.id, err);
                        return Ok((tip.height, added));
                    }
                };
                if let Err(err) = self
                    .verify_enclosed_signature_quorum(&active_delegates, block)
                    .await
                {
                    warn!("Aborting catch-up: block {} lacked a signature quorum: {}", block.id, err);
                    return Ok((tip.height, added));
                }
                if !self.meets_block_policy(block, verified.delegate_changed_keys) {
                    warn!(
                        "Aborting catch-up: block {} did not meet the minimum-transactions policy",
                        block.id
                    );
                    return Ok((tip.height, added));
                }
                self.process_block(block, true).await?;
                added += 1;
            }

            failures = 0;
            self.fetch_pause().await;
        }

        Ok((self.last_processed_block().await.height, added))
    }

    fn parse_block_batch(value: Value, limit: usize) -> Option<Vec<Block>> {
        if !value.is_array() {
            return None;
        }
        let blocks: Vec<Block> = serde_json::from_value(value).ok()?;
        if blocks.len() > limit {
            return None;
        }
        Some(blocks)
    }

    // The first block must extend our tip and the rest must chain onto
    // each other with strictly incrementing heights
    fn batch_links_to(last: &Block, blocks: &[Block]) -> bool {
        let mut previous_id = last.id.as_str();
        let mut previous_height = last.height;
        for block in blocks {
            if block.previous_block_id.as_deref() != Some(previous_id)
                || block.height != previous_height + 1
            {
                return false;
            }
            previous_id = &block.id;
            previous_height = block.height;
        }
        true
    }

    // Ask a sample of peers whether they hold the given block
    async fn sample_block_consensus(&self, block_id: &str) -> usize {
        let procedure = format!("{}:hasBlock", self.config.module_alias);
        let polls = (0..self.config.catch_up_consensus_poll_count).map(|_| {
            self.network
                .request(&procedure, json!({ "blockId": block_id }), None)
        });
        join_all(polls)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(Value::Bool(true))))
            .count()
    }

    // Blocks replayed from peers carry their own co-signature list; the
    // quorum rule still applies to them
    async fn verify_enclosed_signature_quorum(
        &self,
        active_delegates: &[Delegate],
        block: &Block,
    ) -> Result<(), ChainError> {
        let required = self
            .config
            .required_block_signature_count(active_delegates.len());
        let mut signers: HashSet<&str> = HashSet::new();
        for signature in &block.signatures {
            verify_block_signature(
                self.dal.as_ref(),
                self.verifier.as_ref(),
                active_delegates,
                block,
                signature,
            )
            .await?;
            signers.insert(signature.signer_address.as_str());
        }
        if signers.len() < required {
            return Err(ChainError::invalid_block(
                &block.id,
                format!(
                    "only {} of the {} required co-signatures were enclosed",
                    signers.len(),
                    required
                ),
            ));
        }
        Ok(())
    }

    // Advance each local forging client to the key index committed
    // on-chain, e.g. after replaying blocks this node forged before a
    // restart
    pub(crate) async fn sync_forging_key_indexes(&self) {
        for client in &self.forging_clients {
            let account = match self.dal.get_account(client.wallet_address()).await {
                Ok(account) => account,
                Err(_) => continue,
            };
            let Some(committed) = account.next_forging_key_index else {
                continue;
            };
            match client.sync_key_index(KeyType::Forging, committed).await {
                Ok(true) => {
                    info!(
                        "Advanced the forging key index of {} to {}",
                        client.wallet_address(),
                        committed
                    );
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        "Failed to sync the forging key index of {}: {}",
                        client.wallet_address(),
                        err
                    );
                }
            }
        }
    }

    async fn fetch_pause(&self) {
        tokio::time::sleep(Duration::from_millis(self.config.fetch_block_pause)).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use ldpos_common::crypto::CryptoClient;
    use serde_json::json;

    fn sync_config() -> crate::ChainConfig {
        crate::ChainConfig {
            fetch_block_pause: 1,
            fetch_block_end_confirmations: 1,
            max_consecutive_block_fetch_failures: 3,
            min_transactions_per_block: 0,
            ..low_fee_config()
        }
    }

    #[tokio::test]
    async fn test_catch_up_replays_a_confirmed_batch() {
        let node = build_node(1, 1_000, Vec::new(), sync_config()).await;
        let module = &node.module;
        let tip = module.last_processed_block().await;
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, Vec::new()).await;

        let procedure = "ldpos_chain:getSignedBlocksFromHeight";
        node.network
            .queue_response(procedure, json!([block]))
            .await;
        for _ in 0..6 {
            node.network
                .queue_response("ldpos_chain:hasBlock", json!(true))
                .await;
        }
        // a single empty batch confirms the end of the chain
        node.network.queue_response(procedure, json!([])).await;

        let (height, added) = module.catch_up().await.unwrap();
        assert_eq!(added, 1);
        assert_eq!(height, 1);
        assert_eq!(module.last_processed_block().await.id, block.id);
    }

    #[tokio::test]
    async fn test_catch_up_discards_batch_without_consensus() {
        let node = build_node(1, 1_000, Vec::new(), sync_config()).await;
        let module = &node.module;
        let tip = module.last_processed_block().await;
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, Vec::new()).await;

        node.network
            .queue_response("ldpos_chain:getSignedBlocksFromHeight", json!([block]))
            .await;
        // only 2 of the 6 sampled peers confirm the batch tip
        for confirmed in [true, true, false, false, false, false] {
            node.network
                .queue_response("ldpos_chain:hasBlock", json!(confirmed))
                .await;
        }

        let (height, added) = module.catch_up().await.unwrap();
        assert_eq!(added, 0);
        assert_eq!(height, 0);
        assert_eq!(module.last_processed_block().await.height, 0);
    }

    #[tokio::test]
    async fn test_catch_up_discards_batch_with_broken_links() {
        let node = build_node(1, 1_000, Vec::new(), sync_config()).await;
        let module = &node.module;
        let tip = module.last_processed_block().await;
        let mut block = forge_next_block(&node.forgers[0], &tip, 30_000, Vec::new()).await;
        block.previous_block_id = Some("f".repeat(64));

        // every attempt serves the same broken batch until the failure
        // budget runs out
        for _ in 0..3 {
            node.network
                .queue_response("ldpos_chain:getSignedBlocksFromHeight", json!([block]))
                .await;
        }

        let (height, added) = module.catch_up().await.unwrap();
        assert_eq!(added, 0);
        assert_eq!(height, 0);
    }

    #[tokio::test]
    async fn test_catch_up_aborts_on_missing_signature_quorum() {
        let mut config = sync_config();
        config.forger_count = 2;
        let node = build_node(2, 1_000, Vec::new(), config).await;
        let module = &node.module;
        let tip = module.last_processed_block().await;

        // with 2 active delegates and a 0.6 ratio, one co-signature is
        // required; this block encloses none
        let slot_forger = module
            .delegates
            .forger_for_timestamp(30_000)
            .await
            .unwrap();
        let forger = node
            .forgers
            .iter()
            .find(|client| client.wallet_address() == slot_forger.address)
            .unwrap();
        let block = forge_next_block(forger, &tip, 30_000, Vec::new()).await;

        node.network
            .queue_response("ldpos_chain:getSignedBlocksFromHeight", json!([block]))
            .await;
        for _ in 0..6 {
            node.network
                .queue_response("ldpos_chain:hasBlock", json!(true))
                .await;
        }

        let (height, added) = module.catch_up().await.unwrap();
        assert_eq!(added, 0);
        assert_eq!(height, 0);
    }

    #[tokio::test]
    async fn test_catch_up_survives_transient_fetch_failures() {
        let node = build_node(1, 1_000, Vec::new(), sync_config()).await;
        let module = &node.module;
        let tip = module.last_processed_block().await;
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, Vec::new()).await;

        let procedure = "ldpos_chain:getSignedBlocksFromHeight";
        node.network.queue_failure(procedure, "peer went away").await;
        node.network.queue_response(procedure, json!([block])).await;
        for _ in 0..6 {
            node.network
                .queue_response("ldpos_chain:hasBlock", json!(true))
                .await;
        }
        node.network.queue_response(procedure, json!([])).await;

        let (height, added) = module.catch_up().await.unwrap();
        assert_eq!(added, 1);
        assert_eq!(height, 1);
    }
}
