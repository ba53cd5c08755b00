mod selector;
mod stream;

pub use selector::TxSelector;
pub use stream::{KeyIndexWindow, PendingTransaction, SenderStreamState};

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use indexmap::IndexMap;
use log::{debug, trace};
use tokio::sync::{Mutex, RwLock};

use ldpos_common::{
    account::Account,
    crypto::CryptoVerifier,
    time::TimestampMillis,
    transaction::{Transaction, TransactionPayload},
};

use crate::{
    config::ChainConfig,
    core::verify::{
        multisig_key_usage, sig_key_usage, validate_transaction_schema, verify_transaction,
        SenderContext, VerifyMode,
    },
    dal::{AccountProvider, TransactionProvider},
    error::ChainError,
};

// One sender's serial stream. The state mutex is the serialization
// point: admissions for the same sender queue on it while different
// senders verify concurrently. The counters are readable without the
// lock so cap checks and retirement stay cheap.
#[derive(Default)]
struct SenderStream {
    backpressure: AtomicUsize,
    pending_count: AtomicUsize,
    state: Mutex<Option<SenderStreamState>>,
}

// The mempool: a map of per-sender streams plus global indexes over
// pending transaction ids and multisig signer participation.
pub struct Mempool {
    config: Arc<ChainConfig>,
    verifier: Arc<dyn CryptoVerifier>,
    streams: RwLock<HashMap<String, Arc<SenderStream>>>,
    // transaction id -> sender address, in arrival order
    pending_ids: RwLock<IndexMap<String, String>>,
    // signer address -> number of pending multisig transactions signed
    participation: RwLock<HashMap<String, usize>>,
}

impl Mempool {
    pub fn new(config: Arc<ChainConfig>, verifier: Arc<dyn CryptoVerifier>) -> Self {
        Mempool {
            config,
            verifier,
            streams: RwLock::new(HashMap::new()),
            pending_ids: RwLock::new(IndexMap::new()),
            participation: RwLock::new(HashMap::new()),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending_ids.read().await.len()
    }

    pub async fn has_pending(&self, id: &str) -> bool {
        self.pending_ids.read().await.contains_key(id)
    }

    // Full (signed) form of a pending transaction
    pub async fn get_pending(&self, id: &str) -> Option<Transaction> {
        let sender = self.pending_ids.read().await.get(id).cloned()?;
        let stream = self.streams.read().await.get(&sender).cloned()?;
        let guard = stream.state.lock().await;
        guard
            .as_ref()
            .and_then(|state| state.pending.get(id))
            .map(|entry| entry.transaction.clone())
    }

    pub async fn outbound_pending(&self, address: &str) -> Vec<Transaction> {
        let Some(stream) = self.streams.read().await.get(address).cloned() else {
            return Vec::new();
        };
        let guard = stream.state.lock().await;
        guard
            .as_ref()
            .map(|state| {
                state
                    .pending
                    .values()
                    .map(|entry| entry.transaction.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    // Consistent per-sender snapshot for the forging pass, in arrival
    // order within each sender
    pub async fn forging_snapshot(&self) -> Vec<(String, Vec<Transaction>)> {
        let streams: Vec<(String, Arc<SenderStream>)> = self
            .streams
            .read()
            .await
            .iter()
            .map(|(address, stream)| (address.clone(), stream.clone()))
            .collect();

        let mut groups = Vec::new();
        for (address, stream) in streams {
            let guard = stream.state.lock().await;
            if let Some(state) = guard.as_ref() {
                if !state.pending.is_empty() {
                    groups.push((
                        address,
                        state
                            .pending
                            .values()
                            .map(|entry| entry.transaction.clone())
                            .collect(),
                    ));
                }
            }
        }
        groups
    }

    // Admit a fully signed transaction. Verification for the same sender
    // is strictly serial; different senders run concurrently.
    pub async fn add_transaction<D>(
        &self,
        dal: &D,
        transaction: Transaction,
        received: TimestampMillis,
    ) -> Result<(), ChainError>
    where
        D: AccountProvider + TransactionProvider + ?Sized,
    {
        let id = transaction.id.clone();
        let sender = transaction.sender_address.clone();

        validate_transaction_schema(&self.config, &transaction)?;

        if self.pending_ids.read().await.contains_key(&id) || dal.has_transaction(&id).await? {
            return Err(ChainError::invalid_transaction(&id, "transaction was already known"));
        }

        let stream = {
            let mut streams = self.streams.write().await;
            streams
                .entry(sender.clone())
                .or_insert_with(|| Arc::new(SenderStream::default()))
                .clone()
        };

        // a stream at either cap is necessarily non-empty, so rejecting
        // here never leaves a retirable stream behind
        if stream.pending_count.load(Ordering::SeqCst)
            >= self.config.max_pending_transactions_per_account
        {
            return Err(ChainError::MempoolCapacity {
                id,
                address: sender,
                reason: format!(
                    "the {} pending transactions cap was reached",
                    self.config.max_pending_transactions_per_account
                ),
            });
        }
        if stream.backpressure.fetch_add(1, Ordering::SeqCst)
            >= self.config.max_transaction_backpressure_per_account
        {
            stream.backpressure.fetch_sub(1, Ordering::SeqCst);
            return Err(ChainError::MempoolCapacity {
                id,
                address: sender,
                reason: format!(
                    "the {} transaction backpressure cap was reached",
                    self.config.max_transaction_backpressure_per_account
                ),
            });
        }

        let result = self.admit(dal, &stream, transaction, received).await;
        stream.backpressure.fetch_sub(1, Ordering::SeqCst);
        let failed = result.is_err();
        drop(stream);
        if failed {
            self.maybe_retire(&sender).await;
        }
        result
    }

    async fn admit<D>(
        &self,
        dal: &D,
        stream: &Arc<SenderStream>,
        transaction: Transaction,
        received: TimestampMillis,
    ) -> Result<(), ChainError>
    where
        D: AccountProvider + ?Sized,
    {
        let id = transaction.id.clone();
        let sender = transaction.sender_address.clone();

        let mut guard = stream.state.lock().await;
        if guard.is_none() {
            let account = dal.get_account(&sender).await?;
            let mut members = HashMap::new();
            if account.is_multisig() {
                for member_address in dal.get_multisig_wallet_members(&sender).await? {
                    let member = dal.get_account(&member_address).await?;
                    members.insert(member_address, member);
                }
            }
            *guard = Some(SenderStreamState::new(account, members));
        }
        let state = guard.as_mut().expect("stream state was just ensured");

        if state.pending.contains_key(&id) {
            return Err(ChainError::invalid_transaction(&id, "transaction was already pending"));
        }
        if state.pending.len() >= self.config.max_pending_transactions_per_account {
            return Err(ChainError::MempoolCapacity {
                id,
                address: sender,
                reason: format!(
                    "the {} pending transactions cap was reached",
                    self.config.max_pending_transactions_per_account
                ),
            });
        }

        // a key re-registration would invalidate the authentication of
        // every other pending transaction in the stream
        match &transaction.payload {
            TransactionPayload::RegisterSigDetails { .. }
            | TransactionPayload::RegisterMultisigWallet { .. }
                if !state.pending.is_empty() =>
            {
                return Err(ChainError::ordering(
                    &id,
                    format!(
                        "{} is only accepted into an empty stream",
                        transaction.payload.type_name()
                    ),
                ));
            }
            TransactionPayload::RegisterMultisigDetails { .. } => {
                let participating = self
                    .participation
                    .read()
                    .await
                    .get(&sender)
                    .copied()
                    .unwrap_or(0);
                if participating > 0 {
                    return Err(ChainError::ordering(
                        &id,
                        "sender still signs pending multisig transactions",
                    ));
                }
            }
            _ => {}
        }

        verify_transaction(
            self.verifier.as_ref(),
            &self.config,
            &SenderContext {
                account: &state.account,
                members: &state.members,
            },
            &transaction,
            VerifyMode::Full,
            received,
        )
        .await?;

        // stateful-signature ordering windows: check everything before
        // recording anything
        if state.account.is_multisig() {
            let mut admissions = Vec::with_capacity(transaction.signatures.len());
            for packet in &transaction.signatures {
                let member = state
                    .members
                    .get(&packet.signer_address)
                    .expect("membership was verified");
                let usage = multisig_key_usage(member, &id, packet)?;
                let window = state
                    .multisig_windows
                    .get(&packet.signer_address)
                    .copied()
                    .unwrap_or_default();
                window
                    .check(usage, packet.next_multisig_key_index)
                    .map_err(|reason| ChainError::ordering(&id, reason))?;
                admissions.push((
                    packet.signer_address.clone(),
                    usage,
                    packet.next_multisig_key_index,
                ));
            }
            for (signer, usage, index) in admissions {
                state
                    .multisig_windows
                    .entry(signer)
                    .or_default()
                    .record(usage, index);
            }
        } else {
            let usage = sig_key_usage(&self.config, &state.account, &transaction)?;
            let index = transaction
                .next_sig_key_index
                .expect("presence was verified");
            state
                .sig_window
                .check(usage, index)
                .map_err(|reason| ChainError::ordering(&id, reason))?;
            state.sig_window.record(usage, index);
        }

        // accepted: debit the snapshot and publish to the global indexes
        let spend = transaction
            .amount()
            .checked_add(transaction.fee)
            .expect("spend was verified against the balance");
        state.account.balance = state
            .account
            .balance
            .checked_sub(spend)
            .expect("balance was verified to cover the spend");

        let packet_signers: Vec<String> = transaction
            .signatures
            .iter()
            .map(|packet| packet.signer_address.clone())
            .collect();
        state
            .pending
            .insert(id.clone(), PendingTransaction { transaction, received });
        stream
            .pending_count
            .store(state.pending.len(), Ordering::SeqCst);
        drop(guard);

        self.pending_ids.write().await.insert(id.clone(), sender);
        if !packet_signers.is_empty() {
            let mut participation = self.participation.write().await;
            for signer in packet_signers {
                *participation.entry(signer).or_insert(0) += 1;
            }
        }
        trace!("Accepted pending transaction {}", id);
        Ok(())
    }

    // Drop the given ids from their streams, crediting their spend back
    // to the snapshots and rebuilding the ordering windows
    pub async fn remove_transactions(&self, ids: &[String]) {
        self.remove_by_id(ids, true).await;
    }

    // Drop transactions that made it into a processed block. Their spend
    // is not credited back: the post-block revalidation re-derives the
    // snapshots from the freshly written accounts.
    pub(crate) async fn purge_processed(&self, ids: &[String]) {
        self.remove_by_id(ids, false).await;
    }

    async fn remove_by_id(&self, ids: &[String], credit_back: bool) {
        let mut by_sender: HashMap<String, Vec<String>> = HashMap::new();
        {
            let pending_ids = self.pending_ids.read().await;
            for id in ids {
                if let Some(sender) = pending_ids.get(id) {
                    by_sender.entry(sender.clone()).or_default().push(id.clone());
                }
            }
        }
        for (sender, ids) in by_sender {
            self.remove_from_stream(&sender, &ids, credit_back).await;
            self.maybe_retire(&sender).await;
        }
    }

    async fn remove_from_stream(&self, sender: &str, ids: &[String], credit_back: bool) {
        let Some(stream) = self.streams.read().await.get(sender).cloned() else {
            return;
        };
        let mut removed = Vec::new();
        {
            let mut guard = stream.state.lock().await;
            if let Some(state) = guard.as_mut() {
                for id in ids {
                    if let Some(entry) = state.pending.shift_remove(id) {
                        if credit_back {
                            let spend = entry
                                .transaction
                                .amount()
                                .checked_add(entry.transaction.fee)
                                .expect("pending spend overflow");
                            state.account.balance = state
                                .account
                                .balance
                                .checked_add(spend)
                                .expect("balance overflow");
                        }
                        removed.push(entry);
                    }
                }
                if !removed.is_empty() {
                    state.rebuild_windows(&self.config);
                }
                stream
                    .pending_count
                    .store(state.pending.len(), Ordering::SeqCst);
            }
        }
        if !removed.is_empty() {
            self.forget(&removed).await;
        }
    }

    // Drop ids from the global indexes once their entries left a stream
    async fn forget(&self, removed: &[PendingTransaction]) {
        let mut pending_ids = self.pending_ids.write().await;
        let mut participation = self.participation.write().await;
        for entry in removed {
            pending_ids.shift_remove(&entry.transaction.id);
            for packet in &entry.transaction.signatures {
                if let Some(count) = participation.get_mut(&packet.signer_address) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        participation.remove(&packet.signer_address);
                    }
                }
            }
        }
    }

    // After a block mutates accounts: refresh the affected snapshots,
    // drop pending transactions whose keys no longer authenticate, and
    // re-derive balances from the post-block state
    pub async fn revalidate_after_block(&self, updated: &HashMap<String, Account>) {
        let streams: Vec<(String, Arc<SenderStream>)> = self
            .streams
            .read()
            .await
            .iter()
            .map(|(address, stream)| (address.clone(), stream.clone()))
            .collect();

        for (address, stream) in streams {
            let mut dropped = Vec::new();
            {
                let mut guard = stream.state.lock().await;
                let Some(state) = guard.as_mut() else { continue };

                let sender_updated = updated.contains_key(&address);
                let member_updated = state
                    .members
                    .keys()
                    .any(|member| updated.contains_key(member));
                if !sender_updated && !member_updated {
                    continue;
                }

                if let Some(account) = updated.get(&address) {
                    state.account = account.clone();
                }
                for (member_address, member) in state.members.iter_mut() {
                    if let Some(account) = updated.get(member_address) {
                        *member = account.clone();
                    }
                }

                // drop entries that became unverifiable, then re-derive
                // the snapshot balance in arrival order
                let mut remaining = state.account.balance;
                let entries: Vec<PendingTransaction> =
                    state.pending.values().cloned().collect();
                state.pending.clear();
                for entry in entries {
                    let txn = &entry.transaction;
                    let keys_match = if state.account.is_multisig() {
                        txn.signatures.iter().all(|packet| {
                            state
                                .members
                                .get(&packet.signer_address)
                                .map(|member| {
                                    multisig_key_usage(member, &txn.id, packet).is_ok()
                                })
                                .unwrap_or(false)
                        })
                    } else {
                        sig_key_usage(&self.config, &state.account, txn).is_ok()
                    };
                    let spend = txn
                        .amount()
                        .checked_add(txn.fee)
                        .expect("pending spend overflow");
                    if keys_match && spend <= remaining {
                        remaining = remaining
                            .checked_sub(spend)
                            .expect("spend fits the remaining balance");
                        state.pending.insert(txn.id.clone(), entry);
                    } else {
                        debug!(
                            "Purging pending transaction {} which became unverifiable",
                            txn.id
                        );
                        dropped.push(entry);
                    }
                }
                state.account.balance = remaining;
                state.rebuild_windows(&self.config);
                stream
                    .pending_count
                    .store(state.pending.len(), Ordering::SeqCst);
            }
            if !dropped.is_empty() {
                self.forget(&dropped).await;
            }
            drop(stream);
            self.maybe_retire(&address).await;
        }
    }

    // Evict pending transactions older than the expiry window. Returns
    // the number of evicted transactions.
    pub async fn expire(&self, now: TimestampMillis) -> usize {
        let cutoff = now.saturating_sub(self.config.pending_transaction_expiry);
        let streams: Vec<(String, Arc<SenderStream>)> = self
            .streams
            .read()
            .await
            .iter()
            .map(|(address, stream)| (address.clone(), stream.clone()))
            .collect();

        let mut evicted = 0;
        for (address, stream) in streams {
            let expired: Vec<String> = {
                let guard = stream.state.lock().await;
                match guard.as_ref() {
                    Some(state) => state
                        .pending
                        .values()
                        .filter(|entry| entry.received <= cutoff)
                        .map(|entry| entry.transaction.id.clone())
                        .collect(),
                    None => Vec::new(),
                }
            };
            if !expired.is_empty() {
                evicted += expired.len();
                self.remove_from_stream(&address, &expired, true).await;
                drop(stream);
                self.maybe_retire(&address).await;
            }
        }
        if evicted > 0 {
            debug!("Expired {} pending transactions", evicted);
        }
        evicted
    }

    // A stream is retired once nothing references it: no queued
    // admissions, no pending entries, and no in-flight handle clones
    async fn maybe_retire(&self, address: &str) {
        let mut streams = self.streams.write().await;
        if let Some(stream) = streams.get(address) {
            if Arc::strong_count(stream) == 1
                && stream.backpressure.load(Ordering::SeqCst) == 0
                && stream.pending_count.load(Ordering::SeqCst) == 0
            {
                streams.remove(address);
                trace!("Retired the pending stream of {}", address);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}
