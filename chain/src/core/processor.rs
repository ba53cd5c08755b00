// Deterministic application of a verified block. Every account write is
// guarded on updateHeight < blockHeight: re-processing an already
// processed block is a no-op and catch-up can replay blocks safely.

use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use log::{debug, info};
use rand::seq::SliceRandom;

use ldpos_common::{
    account::{Account, AccountType, Delegate},
    amount::Amount,
    block::Block,
    transaction::TransactionPayload,
};

use crate::{
    dal::{AccountPatch, Dal, DalError},
    error::ChainError,
    events::{ChainChange, ModuleEvent},
    ChainModule,
};

// Working copy of one affected account plus the patch that will be
// written. Accounts whose updateHeight already reached the block height
// are frozen: the block's effects were applied by an earlier run.
struct ChangeSet {
    account: Account,
    patch: AccountPatch,
    had_update_height: bool,
    frozen: bool,
    old_balance: Amount,
    balance_changed: bool,
}

impl ChangeSet {
    fn new(account: Account, height: u64) -> Self {
        ChangeSet {
            frozen: account.update_height.map_or(false, |uh| uh >= height),
            had_update_height: account.update_height.is_some(),
            old_balance: account.balance,
            balance_changed: false,
            patch: AccountPatch::default(),
            account,
        }
    }

    fn credit(&mut self, amount: Amount) -> Result<(), ChainError> {
        if self.frozen {
            return Ok(());
        }
        self.account.balance = self
            .account
            .balance
            .checked_add(amount)
            .ok_or_else(|| overflow(&self.account.address))?;
        self.balance_changed = true;
        Ok(())
    }

    fn debit(&mut self, amount: Amount) -> Result<(), ChainError> {
        if self.frozen {
            return Ok(());
        }
        self.account.balance = self
            .account
            .balance
            .checked_sub(amount)
            .ok_or_else(|| overflow(&self.account.address))?;
        self.balance_changed = true;
        Ok(())
    }

    fn advance_forging_keys(&mut self, public_key: &str, next_public_key: &str, next_index: u64) {
        if self.frozen {
            return;
        }
        if self.account.forging_public_key.as_deref() != Some(public_key) {
            self.account.forging_public_key = Some(public_key.to_string());
            self.patch.forging_public_key = Some(public_key.to_string());
            self.account.next_forging_public_key = Some(next_public_key.to_string());
            self.patch.next_forging_public_key = Some(next_public_key.to_string());
        }
        if self.account.next_forging_key_index != Some(next_index) {
            self.account.next_forging_key_index = Some(next_index);
            self.patch.next_forging_key_index = Some(next_index);
        }
    }

    fn advance_sig_keys(&mut self, public_key: &str, next_public_key: &str, next_index: u64) {
        if self.frozen {
            return;
        }
        if self.account.sig_public_key.as_deref() != Some(public_key) {
            self.account.sig_public_key = Some(public_key.to_string());
            self.patch.sig_public_key = Some(public_key.to_string());
            self.account.next_sig_public_key = Some(next_public_key.to_string());
            self.patch.next_sig_public_key = Some(next_public_key.to_string());
        }
        if self.account.next_sig_key_index != Some(next_index) {
            self.account.next_sig_key_index = Some(next_index);
            self.patch.next_sig_key_index = Some(next_index);
        }
    }

    fn advance_multisig_keys(&mut self, public_key: &str, next_public_key: &str, next_index: u64) {
        if self.frozen {
            return;
        }
        if self.account.multisig_public_key.as_deref() != Some(public_key) {
            self.account.multisig_public_key = Some(public_key.to_string());
            self.patch.multisig_public_key = Some(public_key.to_string());
            self.account.next_multisig_public_key = Some(next_public_key.to_string());
            self.patch.next_multisig_public_key = Some(next_public_key.to_string());
        }
        if self.account.next_multisig_key_index != Some(next_index) {
            self.account.next_multisig_key_index = Some(next_index);
            self.patch.next_multisig_key_index = Some(next_index);
        }
    }

    fn convert_to_multisig_wallet(&mut self, required_signature_count: usize) {
        if self.frozen {
            return;
        }
        self.account.account_type = AccountType::Multisig;
        self.patch.account_type = Some(AccountType::Multisig);
        self.account.required_signature_count = Some(required_signature_count);
        self.patch.required_signature_count = Some(required_signature_count);
    }

    fn has_changes(&self) -> bool {
        self.balance_changed || !self.patch.is_empty()
    }
}

fn overflow(address: &str) -> ChainError {
    ChainError::InvalidBlock {
        id: String::new(),
        reason: format!("balance arithmetic overflowed for account {}", address),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoteKind {
    Vote,
    Unvote,
}

struct VoteChange {
    voter: String,
    delegate: String,
    kind: VoteKind,
}

impl<D: Dal> ChainModule<D> {
    // Apply a verified block. `synched` marks blocks replayed during
    // catch-up. The mutation order is fixed: accounts, delegate
    // registrations, wallets, votes, vote weights, the block itself,
    // then the mempool and the delegate cache.
    pub async fn process_block(&self, block: &Block, synched: bool) -> Result<(), ChainError> {
        let height = block.height;
        {
            let last = self.last_processed_block.read().await;
            // a gap between the tip and the incoming block is a caller
            // bug, not a recoverable condition
            assert!(
                height <= last.height + 1,
                "block {} at height {} jumped past the chain tip at {}",
                block.id,
                height,
                last.height
            );
        }
        debug!("Processing block {} at height {}", block.id, height);

        // affected addresses: senders, recipients, multisig signers,
        // proposed wallet members, block signers and the forger
        let mut addresses: IndexSet<String> = IndexSet::new();
        for txn in &block.transactions {
            addresses.insert(txn.sender_address.clone());
            if let Some(recipient) = txn.recipient_address() {
                addresses.insert(recipient.to_string());
            }
            for packet in &txn.signatures {
                addresses.insert(packet.signer_address.clone());
            }
            if let TransactionPayload::RegisterMultisigWallet { member_addresses, .. } =
                &txn.payload
            {
                for member in member_addresses {
                    addresses.insert(member.clone());
                }
            }
        }
        for signature in &block.signatures {
            addresses.insert(signature.signer_address.clone());
        }
        addresses.insert(block.forger_address.clone());

        let mut changes: IndexMap<String, ChangeSet> = IndexMap::new();
        for address in &addresses {
            let account = match self.dal.get_account(address).await {
                Ok(account) => account,
                Err(DalError::AccountDidNotExist(_)) => Account::new(address.clone()),
                Err(err) => return Err(err.into()),
            };
            changes.insert(address.clone(), ChangeSet::new(account, height));
        }

        // forging key advancement for the forger and every co-signer
        changes
            .get_mut(&block.forger_address)
            .expect("forger is in the affected set")
            .advance_forging_keys(
                &block.forging_public_key,
                &block.next_forging_public_key,
                block.next_forging_key_index,
            );
        for signature in &block.signatures {
            changes
                .get_mut(&signature.signer_address)
                .expect("signer is in the affected set")
                .advance_forging_keys(
                    &signature.forging_public_key,
                    &signature.next_forging_public_key,
                    signature.next_forging_key_index,
                );
        }

        let mut total_fees = Amount::ZERO;
        let mut vote_changes: Vec<VoteChange> = Vec::new();
        let mut queued_votes: HashSet<(String, String)> = HashSet::new();
        let mut queued_unvotes: HashSet<(String, String)> = HashSet::new();
        let mut delegate_registrations: IndexSet<String> = IndexSet::new();
        let mut wallet_registrations: Vec<(String, Vec<String>, usize)> = Vec::new();

        for txn in &block.transactions {
            let sender_address = txn.sender_address.clone();

            // sender key advancement recorded from the transaction
            {
                let sender = changes.get_mut(&sender_address).expect("sender is loaded");
                if sender.account.is_multisig() {
                    // handled per packet below
                } else if let (Some(key), Some(next_key), Some(index)) = (
                    &txn.sig_public_key,
                    &txn.next_sig_public_key,
                    txn.next_sig_key_index,
                ) {
                    sender.advance_sig_keys(key, next_key, index);
                }
            }
            for packet in &txn.signatures {
                changes
                    .get_mut(&packet.signer_address)
                    .expect("signer is loaded")
                    .advance_multisig_keys(
                        &packet.multisig_public_key,
                        &packet.next_multisig_public_key,
                        packet.next_multisig_key_index,
                    );
            }

            // fee and amount movement
            let spend = txn
                .amount()
                .checked_add(txn.fee)
                .ok_or_else(|| overflow(&sender_address))?;
            changes
                .get_mut(&sender_address)
                .expect("sender is loaded")
                .debit(spend)?;
            if let Some(recipient) = txn.recipient_address() {
                changes
                    .get_mut(recipient)
                    .expect("recipient is loaded")
                    .credit(txn.amount())?;
            }
            total_fees = total_fees
                .checked_add(txn.fee)
                .ok_or_else(|| overflow(&block.forger_address))?;

            match &txn.payload {
                TransactionPayload::Transfer { .. } => {}
                TransactionPayload::Vote { delegate_address } => {
                    let valid = self
                        .is_vote_valid(
                            &sender_address,
                            delegate_address,
                            &queued_votes,
                            &queued_unvotes,
                            &delegate_registrations,
                        )
                        .await?;
                    if valid {
                        queued_votes
                            .insert((sender_address.clone(), delegate_address.clone()));
                        vote_changes.push(VoteChange {
                            voter: sender_address.clone(),
                            delegate: delegate_address.clone(),
                            kind: VoteKind::Vote,
                        });
                    } else {
                        // invalid votes are a no-op but their fee stays charged
                        debug!(
                            "Transaction {} cast an invalid vote for {}",
                            txn.id, delegate_address
                        );
                    }
                }
                TransactionPayload::Unvote { delegate_address } => {
                    let existing = self
                        .has_effective_vote(
                            &sender_address,
                            delegate_address,
                            &queued_votes,
                            &queued_unvotes,
                        )
                        .await?;
                    if existing {
                        queued_unvotes
                            .insert((sender_address.clone(), delegate_address.clone()));
                        vote_changes.push(VoteChange {
                            voter: sender_address.clone(),
                            delegate: delegate_address.clone(),
                            kind: VoteKind::Unvote,
                        });
                    } else {
                        debug!(
                            "Transaction {} removed a non-existent vote for {}",
                            txn.id, delegate_address
                        );
                    }
                }
                TransactionPayload::RegisterSigDetails {
                    new_sig_public_key,
                    new_next_sig_public_key,
                    new_next_sig_key_index,
                } => {
                    changes
                        .get_mut(&sender_address)
                        .expect("sender is loaded")
                        .advance_sig_keys(
                            new_sig_public_key,
                            new_next_sig_public_key,
                            *new_next_sig_key_index,
                        );
                }
                TransactionPayload::RegisterMultisigDetails {
                    new_multisig_public_key,
                    new_next_multisig_public_key,
                    new_next_multisig_key_index,
                } => {
                    changes
                        .get_mut(&sender_address)
                        .expect("sender is loaded")
                        .advance_multisig_keys(
                            new_multisig_public_key,
                            new_next_multisig_public_key,
                            *new_next_multisig_key_index,
                        );
                }
                TransactionPayload::RegisterForgingDetails {
                    new_forging_public_key,
                    new_next_forging_public_key,
                    new_next_forging_key_index,
                } => {
                    changes
                        .get_mut(&sender_address)
                        .expect("sender is loaded")
                        .advance_forging_keys(
                            new_forging_public_key,
                            new_next_forging_public_key,
                            *new_next_forging_key_index,
                        );
                    if !self.dal.has_delegate(&sender_address).await? {
                        delegate_registrations.insert(sender_address.clone());
                    }
                }
                TransactionPayload::RegisterMultisigWallet {
                    member_addresses,
                    required_signature_count,
                } => {
                    let members_valid = member_addresses.iter().all(|member| {
                        changes
                            .get(member)
                            .map(|change| {
                                change.account.multisig_public_key.is_some()
                                    && !change.account.is_multisig()
                            })
                            .unwrap_or(false)
                    });
                    if members_valid {
                        wallet_registrations.push((
                            sender_address.clone(),
                            member_addresses.clone(),
                            *required_signature_count,
                        ));
                        changes
                            .get_mut(&sender_address)
                            .expect("sender is loaded")
                            .convert_to_multisig_wallet(*required_signature_count);
                    } else {
                        debug!(
                            "Transaction {} proposed an invalid multisig wallet",
                            txn.id
                        );
                    }
                }
            }
        }

        // the whole fee pot goes to the forger
        changes
            .get_mut(&block.forger_address)
            .expect("forger is loaded")
            .credit(total_fees)?;

        // pre-mutation vote sets of every account whose balance moved,
        // for the vote-weight maintenance below
        let mut vote_sets: HashMap<String, Vec<String>> = HashMap::new();
        for (address, change) in &changes {
            if !change.frozen && change.account.balance != change.old_balance {
                vote_sets.insert(
                    address.clone(),
                    self.dal.get_account_votes(address).await?,
                );
            }
        }

        // account writes, guarded on updateHeight
        for (address, change) in changes.iter_mut() {
            if change.frozen || !change.has_changes() {
                continue;
            }
            if change.balance_changed {
                change.patch.balance = Some(change.account.balance);
            }
            if !change.had_update_height {
                change.account.update_height = Some(height);
                self.dal.upsert_account(&change.account).await?;
            } else {
                self.dal
                    .update_account(address, &change.patch, height)
                    .await?;
            }
        }

        // new delegates before votes can reference them
        for address in &delegate_registrations {
            let delegate = Delegate {
                address: address.clone(),
                vote_weight: Amount::ZERO,
                update_height: Some(height),
            };
            self.dal.upsert_delegate(&delegate).await?;
        }
        for (address, members, required) in &wallet_registrations {
            self.dal
                .register_multisig_wallet(address, members, *required)
                .await?;
        }

        // votes against the DAL; a conflicting record means the change
        // already applied in an earlier run of this block
        for change in &vote_changes {
            let result = match change.kind {
                VoteKind::Vote => self.dal.vote(&change.voter, &change.delegate).await,
                VoteKind::Unvote => self.dal.unvote(&change.voter, &change.delegate).await,
            };
            if let Err(DalError::InvalidAction(reason)) = result {
                debug!("Vote change was a no-op: {}", reason);
            } else {
                result?;
            }
        }

        // vote weight maintenance: each delegate moves by the balance
        // deltas of its existing voters, plus the full new balance of
        // voters that explicitly voted or unvoted in this block
        let mut weight_gain: HashMap<String, Amount> = HashMap::new();
        let mut weight_loss: HashMap<String, Amount> = HashMap::new();
        for (address, voted_delegates) in &vote_sets {
            let change = &changes[address];
            let (new_balance, old_balance) = (change.account.balance, change.old_balance);
            for delegate in voted_delegates {
                if new_balance > old_balance {
                    let delta = new_balance.checked_sub(old_balance).expect("ordered");
                    let gain = weight_gain.entry(delegate.clone()).or_insert(Amount::ZERO);
                    *gain = gain.checked_add(delta).ok_or_else(|| overflow(delegate))?;
                } else if old_balance > new_balance {
                    let delta = old_balance.checked_sub(new_balance).expect("ordered");
                    let loss = weight_loss.entry(delegate.clone()).or_insert(Amount::ZERO);
                    *loss = loss.checked_add(delta).ok_or_else(|| overflow(delegate))?;
                }
            }
        }
        for change in &vote_changes {
            let voter_balance = changes[&change.voter].account.balance;
            match change.kind {
                VoteKind::Vote => {
                    let gain = weight_gain
                        .entry(change.delegate.clone())
                        .or_insert(Amount::ZERO);
                    *gain = gain
                        .checked_add(voter_balance)
                        .ok_or_else(|| overflow(&change.delegate))?;
                }
                VoteKind::Unvote => {
                    let loss = weight_loss
                        .entry(change.delegate.clone())
                        .or_insert(Amount::ZERO);
                    *loss = loss
                        .checked_add(voter_balance)
                        .ok_or_else(|| overflow(&change.delegate))?;
                }
            }
        }

        let mut touched_delegates: IndexSet<String> = IndexSet::new();
        touched_delegates.extend(weight_gain.keys().cloned());
        touched_delegates.extend(weight_loss.keys().cloned());
        for address in &touched_delegates {
            let mut delegate = match self.dal.get_delegate(address).await {
                Ok(delegate) => delegate,
                Err(DalError::DelegateDidNotExist(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            if delegate.update_height.map_or(false, |uh| uh >= height) {
                continue;
            }
            let gain = weight_gain.get(address).copied().unwrap_or(Amount::ZERO);
            let loss = weight_loss.get(address).copied().unwrap_or(Amount::ZERO);
            delegate.vote_weight = delegate
                .vote_weight
                .checked_add(gain)
                .ok_or_else(|| overflow(address))?
                .checked_sub(loss)
                .unwrap_or(Amount::ZERO);
            delegate.update_height = Some(height);
            self.dal.upsert_delegate(&delegate).await?;
        }

        // persist the block, subsampling the stored signature list
        let mut stored = block.clone();
        if stored.signatures.len() > self.config.block_signatures_to_provide {
            stored.signatures = {
                let mut rng = rand::thread_rng();
                stored
                    .signatures
                    .choose_multiple(&mut rng, self.config.block_signatures_to_provide)
                    .cloned()
                    .collect()
            };
        }
        self.dal.upsert_block(&stored, synched).await?;

        // purge included transactions, then anything that stopped
        // verifying against the post-block keys
        let included: Vec<String> = block.transactions.iter().map(|txn| txn.id.clone()).collect();
        self.mempool.purge_processed(&included).await;
        let updated: HashMap<String, Account> = changes
            .iter()
            .filter(|(_, change)| !change.frozen)
            .map(|(address, change)| (address.clone(), change.account.clone()))
            .collect();
        self.mempool.revalidate_after_block(&updated).await;

        self.delegates.refresh(self.dal.as_ref()).await?;

        let mut last = self.last_processed_block.write().await;
        if block.height > last.height {
            *last = stored.clone();
            drop(last);
            info!(
                "Processed block {} at height {} with {} transactions",
                block.id,
                height,
                block.transactions.len()
            );
            self.events.publish(ModuleEvent::ChainChanges {
                change: ChainChange::AddBlock {
                    block: block.simplified(),
                },
            });
        }
        Ok(())
    }

    async fn is_vote_valid(
        &self,
        voter: &str,
        delegate: &str,
        queued_votes: &HashSet<(String, String)>,
        queued_unvotes: &HashSet<(String, String)>,
        delegate_registrations: &IndexSet<String>,
    ) -> Result<bool, ChainError> {
        if !self.dal.has_delegate(delegate).await?
            && !delegate_registrations.contains(delegate)
        {
            return Ok(false);
        }
        if self
            .has_effective_vote(voter, delegate, queued_votes, queued_unvotes)
            .await?
        {
            return Ok(false);
        }
        let current = self.dal.get_account_votes(voter).await?;
        let queued_added = queued_votes.iter().filter(|(v, _)| v == voter).count();
        let queued_removed = queued_unvotes.iter().filter(|(v, _)| v == voter).count();
        let effective = current.len() + queued_added - queued_removed.min(current.len());
        Ok(effective < self.config.max_votes_per_account)
    }

    async fn has_effective_vote(
        &self,
        voter: &str,
        delegate: &str,
        queued_votes: &HashSet<(String, String)>,
        queued_unvotes: &HashSet<(String, String)>,
    ) -> Result<bool, ChainError> {
        let key = (voter.to_string(), delegate.to_string());
        if queued_votes.contains(&key) {
            return Ok(true);
        }
        if queued_unvotes.contains(&key) {
            return Ok(false);
        }
        Ok(self.dal.has_vote_for_delegate(voter, delegate).await?)
    }

    // Slots whose block does not meet the minimum-transactions policy
    // are skipped without touching the ledger
    pub(crate) fn emit_skip_block(&self, block: &Block) {
        debug!("Skipping block {} at height {}", block.id, block.height);
        self.events.publish(ModuleEvent::ChainChanges {
            change: ChainChange::SkipBlock {
                block: block.simplified(),
            },
        });
    }

    // The minimum-transactions policy: empty uninteresting slots do not
    // grow the chain, but a forging key rotation always does
    pub(crate) fn meets_block_policy(&self, block: &Block, delegate_changed_keys: bool) -> bool {
        block.transactions.len() >= self.config.min_transactions_per_block
            || delegate_changed_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::{AccountProvider, BlockProvider, DelegateProvider, VoteProvider};
    use crate::test_utils::*;
    use ldpos_common::crypto::{CryptoClient, KeyType, SimCryptoClient};

    fn recipient_address() -> String {
        format!("ldpos{}", "9".repeat(40))
    }

    #[tokio::test]
    async fn test_genesis_successor_transfer() {
        let alice = SimCryptoClient::new("ldpos", "alice");
        let node = build_node(
            1,
            0,
            vec![plain_genesis_account(alice.wallet_address(), 200)],
            low_fee_config(),
        )
        .await;
        let module = &node.module;
        let tip = module.last_processed_block().await;
        assert_eq!(tip.height, 0);
        assert_eq!(tip.timestamp, 0);

        let txn = alice.sign_transaction(unsigned_transfer(
            alice.wallet_address(),
            &recipient_address(),
            100,
            10,
            15_000,
        ));
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, vec![txn]).await;
        assert_eq!(block.height, 1);
        assert_eq!(block.timestamp, 30_000);

        module.process_block(&block, false).await.unwrap();

        let sender = module.dal.get_account(alice.wallet_address()).await.unwrap();
        assert_eq!(sender.balance, Amount::from_u64(90));
        assert_eq!(sender.update_height, Some(1));
        // the sender's first-use key registration landed
        assert_eq!(
            sender.sig_public_key.as_deref(),
            Some(alice.public_key(KeyType::Sig, 0).as_str())
        );

        let recipient = module.dal.get_account(&recipient_address()).await.unwrap();
        assert_eq!(recipient.balance, Amount::from_u64(100));
        assert_eq!(recipient.update_height, Some(1));

        let forger = module
            .dal
            .get_account(node.forgers[0].wallet_address())
            .await
            .unwrap();
        assert_eq!(forger.balance, Amount::from_u64(10));

        let new_tip = module.last_processed_block().await;
        assert_eq!(new_tip.height, 1);
        assert_eq!(new_tip.id, block.id);
    }

    #[tokio::test]
    async fn test_reprocessing_is_a_no_op() {
        let alice = SimCryptoClient::new("ldpos", "alice");
        let node = build_node(
            1,
            0,
            vec![plain_genesis_account(alice.wallet_address(), 200)],
            low_fee_config(),
        )
        .await;
        let module = &node.module;
        let tip = module.last_processed_block().await;

        let txn = alice.sign_transaction(unsigned_transfer(
            alice.wallet_address(),
            &recipient_address(),
            100,
            10,
            15_000,
        ));
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, vec![txn]).await;
        module.process_block(&block, false).await.unwrap();
        module.process_block(&block, false).await.unwrap();

        let sender = module.dal.get_account(alice.wallet_address()).await.unwrap();
        assert_eq!(sender.balance, Amount::from_u64(90));
        let recipient = module.dal.get_account(&recipient_address()).await.unwrap();
        assert_eq!(recipient.balance, Amount::from_u64(100));
        let forger = module
            .dal
            .get_account(node.forgers[0].wallet_address())
            .await
            .unwrap();
        assert_eq!(forger.balance, Amount::from_u64(10));
        assert_eq!(module.last_processed_block().await.height, 1);
    }

    #[tokio::test]
    async fn test_forger_collects_the_fee_sum() {
        let alice = SimCryptoClient::new("ldpos", "alice");
        let node = build_node(
            1,
            0,
            vec![plain_genesis_account(alice.wallet_address(), 1_000)],
            low_fee_config(),
        )
        .await;
        let module = &node.module;
        let tip = module.last_processed_block().await;

        let first = alice.sign_transaction(unsigned_transfer(
            alice.wallet_address(),
            &recipient_address(),
            100,
            10,
            15_000,
        ));
        let second = alice.sign_transaction(unsigned_transfer(
            alice.wallet_address(),
            &recipient_address(),
            50,
            15,
            15_000,
        ));
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, vec![first, second]).await;
        module.process_block(&block, false).await.unwrap();

        let forger = module
            .dal
            .get_account(node.forgers[0].wallet_address())
            .await
            .unwrap();
        assert_eq!(forger.balance, Amount::from_u64(25));
        assert_eq!(block.total_fees(), Amount::from_u64(25));
    }

    #[tokio::test]
    async fn test_vote_and_unvote_maintain_weights() {
        let alice = SimCryptoClient::new("ldpos", "alice");
        let node = build_node(
            1,
            1_000,
            vec![plain_genesis_account(alice.wallet_address(), 200)],
            low_fee_config(),
        )
        .await;
        let module = &node.module;
        let delegate_address = node.forgers[0].wallet_address().to_string();

        let delegate = module.dal.get_delegate(&delegate_address).await.unwrap();
        assert_eq!(delegate.vote_weight, Amount::from_u64(1_000));

        // block 1: alice votes for the delegate
        let tip = module.last_processed_block().await;
        let vote = alice.sign_transaction(unsigned_payload(
            alice.wallet_address(),
            TransactionPayload::Vote {
                delegate_address: delegate_address.clone(),
            },
            1,
            15_000,
        ));
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, vec![vote]).await;
        module.process_block(&block, false).await.unwrap();

        assert!(module
            .dal
            .has_vote_for_delegate(alice.wallet_address(), &delegate_address)
            .await
            .unwrap());
        // 1000 (self) + 1 fee + alice's 199
        let delegate = module.dal.get_delegate(&delegate_address).await.unwrap();
        assert_eq!(delegate.vote_weight, Amount::from_u64(1_200));

        // block 2: alice unvotes again
        let tip = module.last_processed_block().await;
        let unvote = alice.sign_transaction(unsigned_payload(
            alice.wallet_address(),
            TransactionPayload::Unvote {
                delegate_address: delegate_address.clone(),
            },
            1,
            40_000,
        ));
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, vec![unvote]).await;
        module.process_block(&block, false).await.unwrap();

        assert!(!module
            .dal
            .has_vote_for_delegate(alice.wallet_address(), &delegate_address)
            .await
            .unwrap());
        // only the delegate's own balance of 1002 remains
        let delegate = module.dal.get_delegate(&delegate_address).await.unwrap();
        assert_eq!(delegate.vote_weight, Amount::from_u64(1_002));
    }

    #[tokio::test]
    async fn test_invalid_vote_still_charges_the_fee() {
        let alice = SimCryptoClient::new("ldpos", "alice");
        let node = build_node(
            1,
            1_000,
            vec![plain_genesis_account(alice.wallet_address(), 200)],
            low_fee_config(),
        )
        .await;
        let module = &node.module;
        let tip = module.last_processed_block().await;

        let unknown_delegate = format!("ldpos{}", "8".repeat(40));
        let vote = alice.sign_transaction(unsigned_payload(
            alice.wallet_address(),
            TransactionPayload::Vote {
                delegate_address: unknown_delegate.clone(),
            },
            5,
            15_000,
        ));
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, vec![vote]).await;
        module.process_block(&block, false).await.unwrap();

        let sender = module.dal.get_account(alice.wallet_address()).await.unwrap();
        assert_eq!(sender.balance, Amount::from_u64(195));
        assert!(!module
            .dal
            .has_vote_for_delegate(alice.wallet_address(), &unknown_delegate)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_multisig_member_key_advancement() {
        let m1 = SimCryptoClient::new("ldpos", "member-1");
        let m2 = SimCryptoClient::with_keys_per_tree("ldpos", "member-2", 1);
        let m3 = SimCryptoClient::new("ldpos", "member-3");
        let wallet_address = format!("ldpos{}", "5".repeat(40));

        let mut wallet = plain_genesis_account(&wallet_address, 1_000);
        wallet.account_type = ldpos_common::account::AccountType::Multisig;
        let mut extra = vec![wallet];
        for member in [&m1, &m2, &m3] {
            let mut account = plain_genesis_account(member.wallet_address(), 0);
            account.multisig_public_key = Some(member.public_key(KeyType::Multisig, 0));
            account.next_multisig_public_key =
                Some(tree_key_of(member, 1));
            account.next_multisig_key_index = Some(0);
            extra.push(account);
        }

        let node = build_node(1, 0, extra, low_fee_config()).await;
        let module = &node.module;
        // finish the wallet: member list and quorum
        let members: Vec<String> = [&m1, &m2, &m3]
            .iter()
            .map(|m| m.wallet_address().to_string())
            .collect();
        module
            .dal
            .register_multisig_wallet(&wallet_address, &members, 2)
            .await
            .unwrap();
        {
            let mut account = module.dal.get_account(&wallet_address).await.unwrap();
            account.required_signature_count = Some(2);
            module.dal.upsert_account(&account).await.unwrap();
        }

        // m1 signs with its current key, m2 with its next key
        let mut txn = unsigned_transfer(&wallet_address, &recipient_address(), 5, 10, 15_000);
        txn.id = txn.compute_id();
        let m1_packet = m1.make_signature_packet(&txn.id);
        m2.sync_key_index(KeyType::Multisig, 1).await.unwrap();
        let m2_packet = m2.make_signature_packet(&txn.id);
        assert_eq!(m2_packet.multisig_public_key, tree_key_of(&m2, 1));
        txn.signatures = vec![m1_packet.clone(), m2_packet.clone()];

        let tip = module.last_processed_block().await;
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, vec![txn]).await;
        module.process_block(&block, false).await.unwrap();

        // m2's key chain advanced to its committed next key
        let m2_account = module.dal.get_account(m2.wallet_address()).await.unwrap();
        assert_eq!(
            m2_account.multisig_public_key.as_deref(),
            Some(tree_key_of(&m2, 1).as_str())
        );
        assert_eq!(
            m2_account.next_multisig_public_key.as_deref(),
            Some(tree_key_of(&m2, 2).as_str())
        );

        // m1's public keys are unchanged, only its index moved
        let m1_account = module.dal.get_account(m1.wallet_address()).await.unwrap();
        assert_eq!(
            m1_account.multisig_public_key.as_deref(),
            Some(m1.public_key(KeyType::Multisig, 0).as_str())
        );
        assert_eq!(m1_account.next_multisig_key_index, m1_packet.next_multisig_key_index.into());

        // the wallet stays multisig and paid amount + fee
        let wallet = module.dal.get_account(&wallet_address).await.unwrap();
        assert!(wallet.is_multisig());
        assert_eq!(wallet.balance, Amount::from_u64(985));
    }

    fn tree_key_of(client: &SimCryptoClient, tree: u64) -> String {
        client.tree_public_key(KeyType::Multisig, tree)
    }

    #[tokio::test]
    async fn test_register_forging_details_creates_a_delegate() {
        let alice = SimCryptoClient::new("ldpos", "alice");
        let node = build_node(
            1,
            0,
            vec![plain_genesis_account(alice.wallet_address(), 100)],
            low_fee_config(),
        )
        .await;
        let module = &node.module;
        let tip = module.last_processed_block().await;

        let register = alice.sign_transaction(unsigned_payload(
            alice.wallet_address(),
            TransactionPayload::RegisterForgingDetails {
                new_forging_public_key: "a".repeat(64),
                new_next_forging_public_key: "b".repeat(64),
                new_next_forging_key_index: 0,
            },
            1,
            15_000,
        ));
        let block = forge_next_block(&node.forgers[0], &tip, 30_000, vec![register]).await;
        module.process_block(&block, false).await.unwrap();

        assert!(module.dal.has_delegate(alice.wallet_address()).await.unwrap());
        let account = module.dal.get_account(alice.wallet_address()).await.unwrap();
        assert_eq!(account.forging_public_key.as_deref(), Some("a".repeat(64).as_str()));
        let delegate = module.dal.get_delegate(alice.wallet_address()).await.unwrap();
        assert_eq!(delegate.vote_weight, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_stored_signatures_are_subsampled() {
        let mut config = low_fee_config();
        config.block_signatures_to_provide = 2;
        config.min_transactions_per_block = 0;
        let node = build_node(4, 1_000, Vec::new(), config).await;
        let module = &node.module;
        let tip = module.last_processed_block().await;

        let mut block = forge_next_block(&node.forgers[0], &tip, 30_000, Vec::new()).await;
        for cosigner in &node.forgers[1..] {
            block.signatures.push(cosigner.sign_block(&block).await.unwrap());
        }
        assert_eq!(block.signatures.len(), 3);
        module.process_block(&block, false).await.unwrap();

        let stored = module.dal.get_signed_block_at_height(1).await.unwrap();
        assert_eq!(stored.signatures.len(), 2);
    }
}
