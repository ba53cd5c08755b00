use std::collections::HashMap;

use log::{debug, warn};

use ldpos_common::{
    block::Block,
    crypto::CryptoClient,
    time::{get_current_time_in_millis, TimestampMillis},
    transaction::Transaction,
};

use crate::{
    core::{
        mempool::TxSelector,
        verify::{verify_transaction, SenderContext, VerifyMode},
    },
    dal::Dal,
    error::ChainError,
    ChainModule,
};

impl<D: Dal> ChainModule<D> {
    // Assemble and sign the block for a slot this node's delegate owns.
    // Every pending transaction is re-verified against a fresh DAL
    // snapshot; anything that stopped holding up is dropped rather than
    // forged into an invalid block.
    pub(crate) async fn forge_block(
        &self,
        forger: &dyn CryptoClient,
        timestamp: TimestampMillis,
    ) -> Result<Block, ChainError> {
        let last = self.last_processed_block().await;
        let now = get_current_time_in_millis();
        let groups = self.mempool.forging_snapshot().await;

        let mut verified_groups: Vec<Vec<Transaction>> = Vec::with_capacity(groups.len());
        for (address, transactions) in groups {
            let mut account = match self.dal.get_account(&address).await {
                Ok(account) => account,
                Err(err) => {
                    warn!("Skipping pending stream of {}: {}", address, err);
                    continue;
                }
            };
            let mut members = HashMap::new();
            if account.is_multisig() {
                let member_addresses =
                    match self.dal.get_multisig_wallet_members(&address).await {
                        Ok(member_addresses) => member_addresses,
                        Err(err) => {
                            warn!("Skipping pending stream of {}: {}", address, err);
                            continue;
                        }
                    };
                for member_address in member_addresses {
                    match self.dal.get_account(&member_address).await {
                        Ok(member) => {
                            members.insert(member_address, member);
                        }
                        Err(err) => {
                            warn!("Skipping wallet member {}: {}", member_address, err);
                        }
                    }
                }
            }

            let mut kept = Vec::new();
            for transaction in transactions {
                let result = verify_transaction(
                    self.verifier.as_ref(),
                    &self.config,
                    &SenderContext {
                        account: &account,
                        members: &members,
                    },
                    &transaction,
                    VerifyMode::Full,
                    now,
                )
                .await;
                match result {
                    Ok(()) => {
                        let spend = transaction
                            .amount()
                            .checked_add(transaction.fee)
                            .expect("verified spend");
                        account.balance = account
                            .balance
                            .checked_sub(spend)
                            .expect("verified balance");
                        kept.push(transaction);
                    }
                    Err(err) => {
                        debug!("Dropping pending transaction {}: {}", transaction.id, err);
                    }
                }
            }
            if !kept.is_empty() {
                verified_groups.push(kept);
            }
        }

        let selected =
            TxSelector::new(verified_groups).take(self.config.max_transactions_per_block);
        debug!(
            "Forging block at height {} with {} transactions",
            last.height + 1,
            selected.len()
        );

        let block = Block {
            id: String::new(),
            height: last.height + 1,
            timestamp,
            previous_block_id: Some(last.id.clone()),
            forger_address: String::new(),
            forging_public_key: String::new(),
            next_forging_public_key: String::new(),
            next_forging_key_index: 0,
            transactions: selected.iter().map(Transaction::simplify).collect(),
            forger_signature: None,
            signatures: Vec::new(),
        };
        Ok(forger.prepare_block(block).await?)
    }
}
