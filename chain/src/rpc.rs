// The module's request surface: a dispatch table over the DAL and the
// mempool, with every offset/limit pair sanitised against the API caps.
// Failures map onto InvalidActionError-style names for the caller.

use serde_json::{json, Value};

use ldpos_common::{time::get_current_time_in_millis, transaction::Transaction};

use crate::{
    dal::{Dal, SortOrder},
    error::ChainError,
    events::ModuleEvent,
    network::EVENT_TRANSACTION,
    ChainModule,
};

use std::sync::Arc;

fn invalid_params(reason: impl Into<String>) -> ChainError {
    ChainError::Dal(crate::dal::DalError::InvalidAction(reason.into()))
}

fn str_param(params: &Value, key: &str) -> Result<String, ChainError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid_params(format!("the {} parameter was missing", key)))
}

fn u64_param(params: &Value, key: &str) -> Result<u64, ChainError> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid_params(format!("the {} parameter was missing", key)))
}

struct Range {
    offset: usize,
    limit: usize,
    order: SortOrder,
}

impl<D: Dal> ChainModule<D> {
    // Offset/limit/order sanitation: missing values take defaults,
    // excessive values clamp to the configured caps
    fn sanitized_range(&self, params: &Value, private: bool) -> Range {
        let (max_limit, max_offset) = if private {
            (
                self.config.max_private_api_limit,
                self.config.max_private_api_offset,
            )
        } else {
            (
                self.config.max_public_api_limit,
                self.config.max_public_api_offset,
            )
        };
        let offset = params
            .get("offset")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            .min(max_offset as u64) as usize;
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(self.config.api_limit as u64)
            .min(max_limit as u64) as usize;
        let order = match params.get("order").and_then(Value::as_str) {
            Some("desc") => SortOrder::Desc,
            _ => SortOrder::Asc,
        };
        Range {
            offset,
            limit,
            order,
        }
    }

    pub async fn handle_action(
        self: &Arc<Self>,
        action: &str,
        params: Value,
    ) -> Result<Value, ChainError> {
        match action {
            "getNetworkSymbol" => Ok(json!(self.config.network_symbol)),

            "getAccount" => {
                let address = str_param(&params, "walletAddress")?;
                let account = self.dal.get_account(&address).await?;
                Ok(serde_json::to_value(account).expect("account serialization"))
            }
            "getAccountsByBalance" => {
                let range = self.sanitized_range(&params, false);
                let accounts = self
                    .dal
                    .get_accounts_by_balance(range.offset, range.limit, range.order)
                    .await?;
                Ok(serde_json::to_value(accounts).expect("account serialization"))
            }
            "getMultisigWalletMembers" => {
                let address = str_param(&params, "walletAddress")?;
                let members = self.dal.get_multisig_wallet_members(&address).await?;
                Ok(json!(members))
            }
            "getMinMultisigRequiredSignatures" => {
                let address = str_param(&params, "walletAddress")?;
                let account = self.dal.get_account(&address).await?;
                match account.required_signature_count {
                    Some(required) if account.is_multisig() => Ok(json!(required)),
                    _ => Err(ChainError::AccountWasNotMultisig(address)),
                }
            }

            "getSignedPendingTransaction" => {
                let id = str_param(&params, "transactionId")?;
                let transaction = self
                    .mempool
                    .get_pending(&id)
                    .await
                    .ok_or(ChainError::PendingTransactionDidNotExist(id))?;
                Ok(serde_json::to_value(transaction).expect("transaction serialization"))
            }
            "getOutboundPendingTransactions" => {
                let address = str_param(&params, "walletAddress")?;
                let range = self.sanitized_range(&params, false);
                let transactions = self.mempool.outbound_pending(&address).await;
                let page: Vec<Transaction> = transactions
                    .into_iter()
                    .skip(range.offset)
                    .take(range.limit)
                    .collect();
                Ok(serde_json::to_value(page).expect("transaction serialization"))
            }
            "getPendingTransactionCount" => Ok(json!(self.mempool.pending_count().await)),
            "postTransaction" => {
                let transaction: Transaction = serde_json::from_value(
                    params
                        .get("transaction")
                        .cloned()
                        .ok_or_else(|| invalid_params("the transaction parameter was missing"))?,
                )
                .map_err(|err| {
                    ChainError::invalid_transaction("", format!("malformed transaction: {}", err))
                })?;
                self.mempool
                    .add_transaction(
                        self.dal.as_ref(),
                        transaction.clone(),
                        get_current_time_in_millis(),
                    )
                    .await?;
                self.events.publish(ModuleEvent::Transaction {
                    transaction: transaction.clone(),
                });
                self.propagate(
                    EVENT_TRANSACTION,
                    serde_json::to_value(transaction).expect("transaction serialization"),
                );
                Ok(Value::Null)
            }

            "getTransaction" => {
                let id = str_param(&params, "transactionId")?;
                let transaction = self.dal.get_transaction(&id).await?;
                Ok(serde_json::to_value(transaction).expect("transaction serialization"))
            }
            "getTransactionsByTimestamp" => {
                let range = self.sanitized_range(&params, false);
                let transactions = self
                    .dal
                    .get_transactions_by_timestamp(range.offset, range.limit, range.order)
                    .await?;
                Ok(serde_json::to_value(transactions).expect("transaction serialization"))
            }
            "getInboundTransactions" => {
                let address = str_param(&params, "walletAddress")?;
                let range = self.sanitized_range(&params, false);
                let transactions = self
                    .dal
                    .get_inbound_transactions(&address, range.offset, range.limit, range.order)
                    .await?;
                Ok(serde_json::to_value(transactions).expect("transaction serialization"))
            }
            "getOutboundTransactions" => {
                let address = str_param(&params, "walletAddress")?;
                let range = self.sanitized_range(&params, false);
                let transactions = self
                    .dal
                    .get_outbound_transactions(&address, range.offset, range.limit, range.order)
                    .await?;
                Ok(serde_json::to_value(transactions).expect("transaction serialization"))
            }
            "getTransactionsFromBlock" => {
                let block_id = str_param(&params, "blockId")?;
                let transactions = self.dal.get_transactions_from_block(&block_id).await?;
                Ok(serde_json::to_value(transactions).expect("transaction serialization"))
            }
            "getInboundTransactionsFromBlock" => {
                let address = str_param(&params, "walletAddress")?;
                let block_id = str_param(&params, "blockId")?;
                let mut transactions = self.dal.get_transactions_from_block(&block_id).await?;
                transactions.retain(|txn| txn.recipient_address() == Some(address.as_str()));
                Ok(serde_json::to_value(transactions).expect("transaction serialization"))
            }
            "getOutboundTransactionsFromBlock" => {
                let address = str_param(&params, "walletAddress")?;
                let block_id = str_param(&params, "blockId")?;
                let mut transactions = self.dal.get_transactions_from_block(&block_id).await?;
                transactions.retain(|txn| txn.sender_address == address);
                Ok(serde_json::to_value(transactions).expect("transaction serialization"))
            }

            "getLastBlockAtTimestamp" => {
                let timestamp = u64_param(&params, "timestamp")?;
                let block = self.dal.get_last_block_at_timestamp(timestamp).await?;
                Ok(serde_json::to_value(block).expect("block serialization"))
            }
            "getMaxBlockHeight" => Ok(json!(self.dal.get_max_block_height().await?)),
            "getBlocksFromHeight" => {
                let height = u64_param(&params, "height")?;
                let range = self.sanitized_range(&params, false);
                let blocks = self.dal.get_blocks_from_height(height, range.limit).await?;
                Ok(serde_json::to_value(blocks).expect("block serialization"))
            }
            "getSignedBlocksFromHeight" => {
                let height = u64_param(&params, "height")?;
                let range = self.sanitized_range(&params, true);
                let limit = range.limit.min(self.config.fetch_block_limit);
                let blocks = self.dal.get_signed_blocks_from_height(height, limit).await?;
                Ok(serde_json::to_value(blocks).expect("block serialization"))
            }
            "getBlocksBetweenHeights" => {
                let from_height = u64_param(&params, "fromHeight")?;
                let to_height = u64_param(&params, "toHeight")?;
                let range = self.sanitized_range(&params, false);
                let blocks = self
                    .dal
                    .get_blocks_between_heights(from_height, to_height, range.limit)
                    .await?;
                Ok(serde_json::to_value(blocks).expect("block serialization"))
            }
            "getBlockAtHeight" => {
                let height = u64_param(&params, "height")?;
                let block = self.dal.get_block_at_height(height).await?;
                Ok(serde_json::to_value(block).expect("block serialization"))
            }
            "getSignedBlockAtHeight" => {
                let height = u64_param(&params, "height")?;
                let block = self.dal.get_signed_block_at_height(height).await?;
                Ok(serde_json::to_value(block).expect("block serialization"))
            }
            "getBlock" => {
                let id = str_param(&params, "blockId")?;
                let block = self.dal.get_block(&id).await?;
                Ok(serde_json::to_value(block).expect("block serialization"))
            }
            "hasBlock" => {
                let id = str_param(&params, "blockId")?;
                Ok(json!(self.dal.has_block(&id).await?))
            }
            "getBlocksByTimestamp" => {
                let range = self.sanitized_range(&params, false);
                let blocks = self
                    .dal
                    .get_blocks_by_timestamp(range.offset, range.limit, range.order)
                    .await?;
                Ok(serde_json::to_value(blocks).expect("block serialization"))
            }

            "getDelegate" => {
                let address = str_param(&params, "walletAddress")?;
                let delegate = self.dal.get_delegate(&address).await?;
                Ok(serde_json::to_value(delegate).expect("delegate serialization"))
            }
            "getDelegatesByVoteWeight" => {
                let range = self.sanitized_range(&params, false);
                let delegates = self
                    .dal
                    .get_delegates_by_vote_weight(range.offset, range.limit, range.order)
                    .await?;
                Ok(serde_json::to_value(delegates).expect("delegate serialization"))
            }
            "getForgingDelegates" => {
                let delegates = self.delegates.snapshot().await;
                Ok(serde_json::to_value(delegates).expect("delegate serialization"))
            }
            "getAccountVotes" => {
                let address = str_param(&params, "walletAddress")?;
                let votes = self.dal.get_account_votes(&address).await?;
                Ok(json!(votes))
            }

            "getMinFees" => Ok(json!({
                "minTransactionFees": self.config.min_transaction_fees,
                "minMultisigRegistrationFeePerMember":
                    self.config.min_multisig_registration_fee_per_member,
                "minMultisigTransactionFeePerMember":
                    self.config.min_multisig_transaction_fee_per_member,
            })),
            "getModuleOptions" => {
                Ok(serde_json::to_value(self.config.as_ref()).expect("config serialization"))
            }

            _ => Err(invalid_params(format!("unknown action {}", action))),
        }
    }
}
