mod memory;

pub use memory::MemoryDal;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ldpos_common::{
    account::{Account, AccountType, Delegate},
    amount::Amount,
    block::Block,
    genesis::Genesis,
    transaction::Transaction,
};

#[derive(Debug, Error)]
pub enum DalError {
    #[error("Account {0} did not exist")]
    AccountDidNotExist(String),

    #[error("Block {0} did not exist")]
    BlockDidNotExist(String),

    #[error("Transaction {0} did not exist")]
    TransactionDidNotExist(String),

    #[error("Delegate {0} did not exist")]
    DelegateDidNotExist(String),

    #[error("Voter account {0} did not exist")]
    VoterAccountDidNotExist(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    Asc,
    Desc,
}

// A partial account write. The processor patches only the fields a block
// actually changed; a replay guarded on updateHeight patches nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_type: Option<AccountType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_signature_count: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sig_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sig_key_index: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multisig_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_multisig_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_multisig_key_index: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forging_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_forging_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_forging_key_index: Option<u64>,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        serde_json::to_value(self)
            .map(|v| v.as_object().map(|o| o.is_empty()).unwrap_or(true))
            .unwrap_or(true)
    }

    pub fn apply_to(&self, account: &mut Account) {
        if let Some(balance) = self.balance {
            account.balance = balance;
        }
        if let Some(account_type) = self.account_type {
            account.account_type = account_type;
        }
        if let Some(required) = self.required_signature_count {
            account.required_signature_count = Some(required);
        }
        if let Some(key) = &self.sig_public_key {
            account.sig_public_key = Some(key.clone());
        }
        if let Some(key) = &self.next_sig_public_key {
            account.next_sig_public_key = Some(key.clone());
        }
        if let Some(index) = self.next_sig_key_index {
            account.next_sig_key_index = Some(index);
        }
        if let Some(key) = &self.multisig_public_key {
            account.multisig_public_key = Some(key.clone());
        }
        if let Some(key) = &self.next_multisig_public_key {
            account.next_multisig_public_key = Some(key.clone());
        }
        if let Some(index) = self.next_multisig_key_index {
            account.next_multisig_key_index = Some(index);
        }
        if let Some(key) = &self.forging_public_key {
            account.forging_public_key = Some(key.clone());
        }
        if let Some(key) = &self.next_forging_public_key {
            account.next_forging_public_key = Some(key.clone());
        }
        if let Some(index) = self.next_forging_key_index {
            account.next_forging_key_index = Some(index);
        }
    }
}

#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn get_account(&self, address: &str) -> Result<Account, DalError>;

    async fn upsert_account(&self, account: &Account) -> Result<(), DalError>;

    // Patch an existing account at the given update height
    async fn update_account(
        &self,
        address: &str,
        patch: &AccountPatch,
        update_height: u64,
    ) -> Result<(), DalError>;

    async fn get_accounts_by_balance(
        &self,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Account>, DalError>;

    async fn get_multisig_wallet_members(&self, address: &str) -> Result<Vec<String>, DalError>;

    async fn register_multisig_wallet(
        &self,
        address: &str,
        member_addresses: &[String],
        required_signature_count: usize,
    ) -> Result<(), DalError>;
}

#[async_trait]
pub trait DelegateProvider: Send + Sync {
    async fn get_delegate(&self, address: &str) -> Result<Delegate, DalError>;

    async fn has_delegate(&self, address: &str) -> Result<bool, DalError>;

    async fn upsert_delegate(&self, delegate: &Delegate) -> Result<(), DalError>;

    // Secondary ordering contract: ties on voteWeight break on address
    // ascending
    async fn get_delegates_by_vote_weight(
        &self,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Delegate>, DalError>;
}

#[async_trait]
pub trait VoteProvider: Send + Sync {
    async fn get_account_votes(&self, voter_address: &str) -> Result<Vec<String>, DalError>;

    async fn has_vote_for_delegate(
        &self,
        voter_address: &str,
        delegate_address: &str,
    ) -> Result<bool, DalError>;

    async fn vote(&self, voter_address: &str, delegate_address: &str) -> Result<(), DalError>;

    async fn unvote(&self, voter_address: &str, delegate_address: &str) -> Result<(), DalError>;
}

#[async_trait]
pub trait TransactionProvider: Send + Sync {
    async fn get_transaction(&self, id: &str) -> Result<Transaction, DalError>;

    async fn has_transaction(&self, id: &str) -> Result<bool, DalError>;

    async fn get_transactions_by_timestamp(
        &self,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Transaction>, DalError>;

    async fn get_inbound_transactions(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Transaction>, DalError>;

    async fn get_outbound_transactions(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Transaction>, DalError>;

    async fn get_transactions_from_block(&self, block_id: &str)
        -> Result<Vec<Transaction>, DalError>;
}

#[async_trait]
pub trait BlockProvider: Send + Sync {
    async fn get_block(&self, id: &str) -> Result<Block, DalError>;

    async fn has_block(&self, id: &str) -> Result<bool, DalError>;

    async fn get_block_at_height(&self, height: u64) -> Result<Block, DalError>;

    async fn get_blocks_from_height(
        &self,
        height: u64,
        limit: usize,
    ) -> Result<Vec<Block>, DalError>;

    async fn get_blocks_between_heights(
        &self,
        from_height: u64,
        to_height: u64,
        limit: usize,
    ) -> Result<Vec<Block>, DalError>;

    async fn get_blocks_by_timestamp(
        &self,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Block>, DalError>;

    // Signed variants carry the stored co-signature list
    async fn get_signed_blocks_from_height(
        &self,
        height: u64,
        limit: usize,
    ) -> Result<Vec<Block>, DalError>;

    async fn get_signed_block_at_height(&self, height: u64) -> Result<Block, DalError>;

    async fn get_last_block_at_timestamp(&self, timestamp: u64) -> Result<Block, DalError>;

    async fn get_max_block_height(&self) -> Result<u64, DalError>;

    async fn upsert_block(&self, block: &Block, synched: bool) -> Result<(), DalError>;
}

// The full persistence surface the module is loaded with. The concrete
// engine is supplied from outside; MemoryDal backs tests and simulation.
#[async_trait]
pub trait Dal:
    AccountProvider
    + DelegateProvider
    + VoteProvider
    + TransactionProvider
    + BlockProvider
    + Send
    + Sync
    + 'static
{
    async fn init(&self, genesis: &Genesis) -> Result<(), DalError>;

    async fn destroy(&self) -> Result<(), DalError>;
}
