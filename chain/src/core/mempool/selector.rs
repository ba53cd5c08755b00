use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
};

use ldpos_common::{amount::Amount, transaction::Transaction};

// Groups one sender's pending transactions for block packaging. Groups
// are ordered against each other by average fee; the heap pops the most
// valuable group first and a sender's transactions always leave in their
// in-group order so the stateful key chain is never reordered.
struct SenderGroup {
    transactions: VecDeque<Transaction>,
    total_fees: Amount,
    count: u64,
}

impl SenderGroup {
    fn new(transactions: Vec<Transaction>) -> Self {
        let total_fees = transactions.iter().map(|txn| txn.fee).sum();
        let count = transactions.len() as u64;
        SenderGroup {
            transactions: VecDeque::from(transactions),
            total_fees,
            count,
        }
    }

    // Compare average fees without dividing: a/|a| vs b/|b| as
    // cross-multiplication
    fn compare_average_fee(&self, other: &Self) -> Ordering {
        let left = self.total_fees.checked_mul_u64(other.count.max(1));
        let right = other.total_fees.checked_mul_u64(self.count.max(1));
        left.cmp(&right)
    }
}

impl PartialEq for SenderGroup {
    fn eq(&self, other: &Self) -> bool {
        self.compare_average_fee(other) == Ordering::Equal
    }
}

impl Eq for SenderGroup {}

impl PartialOrd for SenderGroup {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SenderGroup {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_average_fee(other)
    }
}

// Sig senders: ascending by the committed next key index, so lower key
// indexes are always processed first
fn sort_sig_group(transactions: &mut [Transaction]) {
    transactions.sort_by_key(|txn| txn.next_sig_key_index.unwrap_or(0));
}

// Multisig senders: ascending by the mean key-index spread of the
// packets, i.e. how far each packet's committed index sits above the
// group's per-member minimum
fn sort_multisig_group(transactions: &mut [Transaction]) {
    let mut member_minimum: HashMap<String, u64> = HashMap::new();
    for txn in transactions.iter() {
        for packet in &txn.signatures {
            member_minimum
                .entry(packet.signer_address.clone())
                .and_modify(|minimum| {
                    *minimum = (*minimum).min(packet.next_multisig_key_index)
                })
                .or_insert(packet.next_multisig_key_index);
        }
    }

    // mean spread as (sum, count) to compare without floats
    let spread_of = |txn: &Transaction| -> (u128, u128) {
        let sum: u128 = txn
            .signatures
            .iter()
            .map(|packet| {
                let minimum = member_minimum[&packet.signer_address];
                (packet.next_multisig_key_index - minimum) as u128
            })
            .sum();
        (sum, txn.signatures.len().max(1) as u128)
    };

    let mut spreads: HashMap<String, (u128, u128)> = HashMap::new();
    for txn in transactions.iter() {
        spreads.insert(txn.id.clone(), spread_of(txn));
    }
    transactions.sort_by(|a, b| {
        let (a_sum, a_count) = spreads[&a.id];
        let (b_sum, b_count) = spreads[&b.id];
        (a_sum * b_count).cmp(&(b_sum * a_count))
    });
}

pub struct TxSelector {
    queue: BinaryHeap<SenderGroup>,
}

impl TxSelector {
    // Build from per-sender groups, applying the in-group key-index
    // ordering before the groups enter the fee heap
    pub fn new(groups: Vec<Vec<Transaction>>) -> Self {
        let mut queue = BinaryHeap::with_capacity(groups.len());
        for mut group in groups {
            if group.is_empty() {
                continue;
            }
            if group[0].signatures.is_empty() {
                sort_sig_group(&mut group);
            } else {
                sort_multisig_group(&mut group);
            }
            queue.push(SenderGroup::new(group));
        }
        TxSelector { queue }
    }

    // Next transaction from the group with the highest average fee
    pub fn next(&mut self) -> Option<Transaction> {
        let mut group = self.queue.pop()?;
        let txn = group.transactions.pop_front()?;
        if !group.transactions.is_empty() {
            self.queue.push(group);
        }
        Some(txn)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    // Take up to limit transactions, whole-group-first by fee rank
    pub fn take(mut self, limit: usize) -> Vec<Transaction> {
        let mut selected = Vec::with_capacity(limit);
        while selected.len() < limit {
            match self.next() {
                Some(txn) => selected.push(txn),
                None => break,
            }
        }
        selected
    }
}
