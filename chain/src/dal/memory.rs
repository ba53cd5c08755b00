// In-memory DAL used by tests and local simulation. It implements the
// same contract a persistent engine would, including the secondary
// address-ascending ordering on ties.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use log::warn;
use tokio::sync::RwLock;

use ldpos_common::{
    account::{Account, Delegate},
    amount::Amount,
    block::Block,
    genesis::Genesis,
    transaction::Transaction,
};

use super::{
    AccountPatch, AccountProvider, BlockProvider, Dal, DalError, DelegateProvider, SortOrder,
    TransactionProvider, VoteProvider,
};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    delegates: HashMap<String, Delegate>,
    // voter address -> delegate addresses, in vote order
    votes: HashMap<String, Vec<String>>,
    // wallet address -> member addresses
    multisig_members: HashMap<String, Vec<String>>,
    blocks_by_height: BTreeMap<u64, Block>,
    block_heights: HashMap<String, u64>,
    transactions: HashMap<String, Transaction>,
}

#[derive(Default)]
pub struct MemoryDal {
    state: RwLock<MemoryState>,
}

impl MemoryDal {
    pub fn new() -> Self {
        MemoryDal::default()
    }
}

fn paginate<T>(mut items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    if offset >= items.len() {
        return Vec::new();
    }
    let mut page: Vec<T> = items.drain(offset..).collect();
    page.truncate(limit);
    page
}

#[async_trait]
impl AccountProvider for MemoryDal {
    async fn get_account(&self, address: &str) -> Result<Account, DalError> {
        let state = self.state.read().await;
        state
            .accounts
            .get(address)
            .cloned()
            .ok_or_else(|| DalError::AccountDidNotExist(address.to_string()))
    }

    async fn upsert_account(&self, account: &Account) -> Result<(), DalError> {
        let mut state = self.state.write().await;
        state
            .accounts
            .insert(account.address.clone(), account.clone());
        Ok(())
    }

    async fn update_account(
        &self,
        address: &str,
        patch: &AccountPatch,
        update_height: u64,
    ) -> Result<(), DalError> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(address)
            .ok_or_else(|| DalError::AccountDidNotExist(address.to_string()))?;
        patch.apply_to(account);
        account.update_height = Some(update_height);
        Ok(())
    }

    async fn get_accounts_by_balance(
        &self,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Account>, DalError> {
        let state = self.state.read().await;
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| match order {
            SortOrder::Asc => a
                .balance
                .cmp(&b.balance)
                .then_with(|| a.address.cmp(&b.address)),
            SortOrder::Desc => b
                .balance
                .cmp(&a.balance)
                .then_with(|| a.address.cmp(&b.address)),
        });
        Ok(paginate(accounts, offset, limit))
    }

    async fn get_multisig_wallet_members(&self, address: &str) -> Result<Vec<String>, DalError> {
        let state = self.state.read().await;
        if !state.accounts.contains_key(address) {
            return Err(DalError::AccountDidNotExist(address.to_string()));
        }
        state
            .multisig_members
            .get(address)
            .cloned()
            .ok_or_else(|| {
                DalError::InvalidAction(format!("Account {} was not a multisig wallet", address))
            })
    }

    async fn register_multisig_wallet(
        &self,
        address: &str,
        member_addresses: &[String],
        required_signature_count: usize,
    ) -> Result<(), DalError> {
        let mut state = self.state.write().await;
        if !state.accounts.contains_key(address) {
            return Err(DalError::AccountDidNotExist(address.to_string()));
        }
        if required_signature_count > member_addresses.len() {
            return Err(DalError::InvalidAction(format!(
                "Required signature count {} exceeded the {} wallet members",
                required_signature_count,
                member_addresses.len()
            )));
        }
        state
            .multisig_members
            .insert(address.to_string(), member_addresses.to_vec());
        Ok(())
    }
}

#[async_trait]
impl DelegateProvider for MemoryDal {
    async fn get_delegate(&self, address: &str) -> Result<Delegate, DalError> {
        let state = self.state.read().await;
        state
            .delegates
            .get(address)
            .cloned()
            .ok_or_else(|| DalError::DelegateDidNotExist(address.to_string()))
    }

    async fn has_delegate(&self, address: &str) -> Result<bool, DalError> {
        let state = self.state.read().await;
        Ok(state.delegates.contains_key(address))
    }

    async fn upsert_delegate(&self, delegate: &Delegate) -> Result<(), DalError> {
        let mut state = self.state.write().await;
        state
            .delegates
            .insert(delegate.address.clone(), delegate.clone());
        Ok(())
    }

    async fn get_delegates_by_vote_weight(
        &self,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Delegate>, DalError> {
        let state = self.state.read().await;
        let mut delegates: Vec<Delegate> = state.delegates.values().cloned().collect();
        delegates.sort_by(|a, b| match order {
            SortOrder::Asc => a
                .vote_weight
                .cmp(&b.vote_weight)
                .then_with(|| a.address.cmp(&b.address)),
            SortOrder::Desc => b
                .vote_weight
                .cmp(&a.vote_weight)
                .then_with(|| a.address.cmp(&b.address)),
        });
        Ok(paginate(delegates, offset, limit))
    }
}

#[async_trait]
impl VoteProvider for MemoryDal {
    async fn get_account_votes(&self, voter_address: &str) -> Result<Vec<String>, DalError> {
        let state = self.state.read().await;
        Ok(state.votes.get(voter_address).cloned().unwrap_or_default())
    }

    async fn has_vote_for_delegate(
        &self,
        voter_address: &str,
        delegate_address: &str,
    ) -> Result<bool, DalError> {
        let state = self.state.read().await;
        Ok(state
            .votes
            .get(voter_address)
            .map(|votes| votes.iter().any(|d| d == delegate_address))
            .unwrap_or(false))
    }

    async fn vote(&self, voter_address: &str, delegate_address: &str) -> Result<(), DalError> {
        let mut state = self.state.write().await;
        if !state.accounts.contains_key(voter_address) {
            return Err(DalError::VoterAccountDidNotExist(voter_address.to_string()));
        }
        if !state.delegates.contains_key(delegate_address) {
            return Err(DalError::DelegateDidNotExist(delegate_address.to_string()));
        }
        let votes = state.votes.entry(voter_address.to_string()).or_default();
        if votes.iter().any(|d| d == delegate_address) {
            return Err(DalError::InvalidAction(format!(
                "Voter {} already voted for delegate {}",
                voter_address, delegate_address
            )));
        }
        votes.push(delegate_address.to_string());
        Ok(())
    }

    async fn unvote(&self, voter_address: &str, delegate_address: &str) -> Result<(), DalError> {
        let mut state = self.state.write().await;
        let votes = state
            .votes
            .get_mut(voter_address)
            .ok_or_else(|| DalError::VoterAccountDidNotExist(voter_address.to_string()))?;
        let before = votes.len();
        votes.retain(|d| d != delegate_address);
        if votes.len() == before {
            return Err(DalError::InvalidAction(format!(
                "Voter {} had no vote for delegate {}",
                voter_address, delegate_address
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionProvider for MemoryDal {
    async fn get_transaction(&self, id: &str) -> Result<Transaction, DalError> {
        let state = self.state.read().await;
        state
            .transactions
            .get(id)
            .cloned()
            .ok_or_else(|| DalError::TransactionDidNotExist(id.to_string()))
    }

    async fn has_transaction(&self, id: &str) -> Result<bool, DalError> {
        let state = self.state.read().await;
        Ok(state.transactions.contains_key(id))
    }

    async fn get_transactions_by_timestamp(
        &self,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Transaction>, DalError> {
        let state = self.state.read().await;
        let mut transactions: Vec<Transaction> = state.transactions.values().cloned().collect();
        transactions.sort_by(|a, b| match order {
            SortOrder::Asc => a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)),
            SortOrder::Desc => b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)),
        });
        Ok(paginate(transactions, offset, limit))
    }

    async fn get_inbound_transactions(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Transaction>, DalError> {
        let mut transactions = self
            .get_transactions_by_timestamp(0, usize::MAX, order)
            .await?;
        transactions.retain(|txn| txn.recipient_address() == Some(address));
        Ok(paginate(transactions, offset, limit))
    }

    async fn get_outbound_transactions(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Transaction>, DalError> {
        let mut transactions = self
            .get_transactions_by_timestamp(0, usize::MAX, order)
            .await?;
        transactions.retain(|txn| txn.sender_address == address);
        Ok(paginate(transactions, offset, limit))
    }

    async fn get_transactions_from_block(
        &self,
        block_id: &str,
    ) -> Result<Vec<Transaction>, DalError> {
        let state = self.state.read().await;
        let height = state
            .block_heights
            .get(block_id)
            .ok_or_else(|| DalError::BlockDidNotExist(block_id.to_string()))?;
        let block = &state.blocks_by_height[height];
        Ok(block.transactions.clone())
    }
}

#[async_trait]
impl BlockProvider for MemoryDal {
    async fn get_block(&self, id: &str) -> Result<Block, DalError> {
        let state = self.state.read().await;
        let height = state
            .block_heights
            .get(id)
            .ok_or_else(|| DalError::BlockDidNotExist(id.to_string()))?;
        Ok(state.blocks_by_height[height].simplified())
    }

    async fn has_block(&self, id: &str) -> Result<bool, DalError> {
        let state = self.state.read().await;
        Ok(state.block_heights.contains_key(id))
    }

    async fn get_block_at_height(&self, height: u64) -> Result<Block, DalError> {
        let state = self.state.read().await;
        state
            .blocks_by_height
            .get(&height)
            .map(Block::simplified)
            .ok_or_else(|| DalError::BlockDidNotExist(format!("height {}", height)))
    }

    async fn get_blocks_from_height(
        &self,
        height: u64,
        limit: usize,
    ) -> Result<Vec<Block>, DalError> {
        let state = self.state.read().await;
        Ok(state
            .blocks_by_height
            .range(height..)
            .take(limit)
            .map(|(_, block)| block.simplified())
            .collect())
    }

    async fn get_blocks_between_heights(
        &self,
        from_height: u64,
        to_height: u64,
        limit: usize,
    ) -> Result<Vec<Block>, DalError> {
        let state = self.state.read().await;
        Ok(state
            .blocks_by_height
            .range(from_height..=to_height)
            .take(limit)
            .map(|(_, block)| block.simplified())
            .collect())
    }

    async fn get_blocks_by_timestamp(
        &self,
        offset: usize,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<Block>, DalError> {
        let state = self.state.read().await;
        let mut blocks: Vec<Block> = state
            .blocks_by_height
            .values()
            .map(Block::simplified)
            .collect();
        if order == SortOrder::Desc {
            blocks.reverse();
        }
        Ok(paginate(blocks, offset, limit))
    }

    async fn get_signed_blocks_from_height(
        &self,
        height: u64,
        limit: usize,
    ) -> Result<Vec<Block>, DalError> {
        let state = self.state.read().await;
        Ok(state
            .blocks_by_height
            .range(height..)
            .take(limit)
            .map(|(_, block)| block.clone())
            .collect())
    }

    async fn get_signed_block_at_height(&self, height: u64) -> Result<Block, DalError> {
        let state = self.state.read().await;
        state
            .blocks_by_height
            .get(&height)
            .cloned()
            .ok_or_else(|| DalError::BlockDidNotExist(format!("height {}", height)))
    }

    async fn get_last_block_at_timestamp(&self, timestamp: u64) -> Result<Block, DalError> {
        let state = self.state.read().await;
        state
            .blocks_by_height
            .values()
            .rev()
            .find(|block| block.timestamp <= timestamp)
            .map(Block::simplified)
            .ok_or_else(|| DalError::BlockDidNotExist(format!("at timestamp {}", timestamp)))
    }

    async fn get_max_block_height(&self) -> Result<u64, DalError> {
        let state = self.state.read().await;
        Ok(state
            .blocks_by_height
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    async fn upsert_block(&self, block: &Block, _synched: bool) -> Result<(), DalError> {
        let mut state = self.state.write().await;
        state
            .block_heights
            .insert(block.id.clone(), block.height);
        for txn in &block.transactions {
            let mut stored = txn.clone();
            stored.block_id = Some(block.id.clone());
            state.transactions.insert(stored.id.clone(), stored);
        }
        state.blocks_by_height.insert(block.height, block.clone());
        Ok(())
    }
}

#[async_trait]
impl Dal for MemoryDal {
    async fn init(&self, genesis: &Genesis) -> Result<(), DalError> {
        let mut state = self.state.write().await;
        let state = &mut *state;

        for seed in &genesis.accounts {
            let mut account = Account::new(seed.address.clone());
            account.account_type = seed.account_type;
            account.balance = seed.balance;
            account.sig_public_key = seed.sig_public_key.clone();
            account.next_sig_public_key = seed.next_sig_public_key.clone();
            account.next_sig_key_index = seed.next_sig_key_index;
            account.multisig_public_key = seed.multisig_public_key.clone();
            account.next_multisig_public_key = seed.next_multisig_public_key.clone();
            account.next_multisig_key_index = seed.next_multisig_key_index;
            account.forging_public_key = seed.forging_public_key.clone();
            account.next_forging_public_key = seed.next_forging_public_key.clone();
            account.next_forging_key_index = seed.next_forging_key_index;

            if seed.forging_public_key.is_some() {
                state
                    .delegates
                    .insert(seed.address.clone(), Delegate::new(seed.address.clone()));
            }
            state.accounts.insert(seed.address.clone(), account);
        }

        // votes and vote weights, once every delegate is known
        for seed in &genesis.accounts {
            for delegate_address in &seed.votes {
                let Some(delegate) = state.delegates.get_mut(delegate_address) else {
                    warn!(
                        "Genesis account {} voted for unknown delegate {}",
                        seed.address, delegate_address
                    );
                    continue;
                };
                delegate.vote_weight = delegate
                    .vote_weight
                    .checked_add(seed.balance)
                    .unwrap_or(Amount::ZERO);
                state
                    .votes
                    .entry(seed.address.clone())
                    .or_default()
                    .push(delegate_address.clone());
            }
        }

        Ok(())
    }

    async fn destroy(&self) -> Result<(), DalError> {
        let mut state = self.state.write().await;
        *state = MemoryState::default();
        Ok(())
    }
}
