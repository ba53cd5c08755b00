use std::collections::HashMap;

use indexmap::IndexMap;

use ldpos_common::{account::Account, time::TimestampMillis, transaction::Transaction};

use crate::{config::ChainConfig, core::verify::{multisig_key_usage, sig_key_usage, KeyUsage}};

// Window over the key indexes of a sender's pending transactions.
//
// The signature scheme is stateful: a transaction signed with key index k
// placed before one signed with k' < k by the same holder would
// invalidate the second on processing. Transactions signed with the
// current key commit indexes that must stay below every index already
// committed by next-key transactions; next-key transactions must commit
// above every current-key index.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyIndexWindow {
    // lowest nextKeyIndex among pending transactions signed with the
    // next public key
    pub lowest_next_key_index: Option<u64>,
    // highest nextKeyIndex among pending transactions signed with the
    // current public key
    pub highest_key_index: Option<u64>,
}

impl KeyIndexWindow {
    pub fn check(&self, usage: KeyUsage, next_key_index: u64) -> Result<(), String> {
        match usage {
            KeyUsage::Next => match self.highest_key_index {
                Some(highest) if next_key_index <= highest => Err(format!(
                    "next-key index {} was not above the highest pending current-key index {}",
                    next_key_index, highest
                )),
                _ => Ok(()),
            },
            KeyUsage::Current => match self.lowest_next_key_index {
                Some(lowest) if next_key_index >= lowest => Err(format!(
                    "current-key index {} was not below the lowest pending next-key index {}",
                    next_key_index, lowest
                )),
                _ => Ok(()),
            },
        }
    }

    pub fn record(&mut self, usage: KeyUsage, next_key_index: u64) {
        match usage {
            KeyUsage::Next => {
                self.lowest_next_key_index = Some(
                    self.lowest_next_key_index
                        .map_or(next_key_index, |lowest| lowest.min(next_key_index)),
                );
            }
            KeyUsage::Current => {
                self.highest_key_index = Some(
                    self.highest_key_index
                        .map_or(next_key_index, |highest| highest.max(next_key_index)),
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub transaction: Transaction,
    pub received: TimestampMillis,
}

// State behind one sender's serial stream: the in-memory account
// snapshot (balance already debited by accepted pending transactions),
// the wallet member snapshots for multisig senders, the ordered pending
// queue and the key-index windows.
pub struct SenderStreamState {
    pub account: Account,
    pub members: HashMap<String, Account>,
    pub pending: IndexMap<String, PendingTransaction>,
    pub sig_window: KeyIndexWindow,
    pub multisig_windows: HashMap<String, KeyIndexWindow>,
}

impl SenderStreamState {
    pub fn new(account: Account, members: HashMap<String, Account>) -> Self {
        SenderStreamState {
            account,
            members,
            pending: IndexMap::new(),
            sig_window: KeyIndexWindow::default(),
            multisig_windows: HashMap::new(),
        }
    }

    // Recompute the windows from the remaining pending queue after a
    // purge. Entries whose keys no longer resolve against the snapshot
    // must have been dropped before calling this.
    pub fn rebuild_windows(&mut self, config: &ChainConfig) {
        self.sig_window = KeyIndexWindow::default();
        self.multisig_windows.clear();

        for entry in self.pending.values() {
            let txn = &entry.transaction;
            if self.account.is_multisig() {
                for packet in &txn.signatures {
                    let Some(member) = self.members.get(&packet.signer_address) else {
                        continue;
                    };
                    if let Ok(usage) = multisig_key_usage(member, &txn.id, packet) {
                        self.multisig_windows
                            .entry(packet.signer_address.clone())
                            .or_default()
                            .record(usage, packet.next_multisig_key_index);
                    }
                }
            } else if let Ok(usage) = sig_key_usage(config, &self.account, txn) {
                if let Some(index) = txn.next_sig_key_index {
                    self.sig_window.record(usage, index);
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_literal_ordering_scenario() {
        // t1 signed with the next key at index 5
        let mut window = KeyIndexWindow::default();
        window.check(KeyUsage::Next, 5).unwrap();
        window.record(KeyUsage::Next, 5);
        assert_eq!(window.lowest_next_key_index, Some(5));

        // t2 signed with the current key at index 5: equal to the lowest
        // pending next-key index, so it is rejected
        assert!(window.check(KeyUsage::Current, 5).is_err());

        // with index 4 it is accepted
        window.check(KeyUsage::Current, 4).unwrap();
        window.record(KeyUsage::Current, 4);
        assert_eq!(window.highest_key_index, Some(4));
    }

    #[test]
    fn test_window_rejects_low_next_key_index() {
        let mut window = KeyIndexWindow::default();
        window.record(KeyUsage::Current, 7);
        assert!(window.check(KeyUsage::Next, 7).is_err());
        assert!(window.check(KeyUsage::Next, 6).is_err());
        window.check(KeyUsage::Next, 8).unwrap();
    }

    #[test]
    fn test_window_tracks_extremes() {
        let mut window = KeyIndexWindow::default();
        window.record(KeyUsage::Next, 9);
        window.record(KeyUsage::Next, 7);
        assert_eq!(window.lowest_next_key_index, Some(7));
        window.record(KeyUsage::Current, 2);
        window.record(KeyUsage::Current, 5);
        assert_eq!(window.highest_key_index, Some(5));
        // the gap between 5 and 7 stays open to both usages
        window.check(KeyUsage::Current, 6).unwrap();
        window.check(KeyUsage::Next, 6).unwrap();
        // but neither side may cross the other's extreme
        window.check(KeyUsage::Current, 7).unwrap_err();
        window.check(KeyUsage::Next, 5).unwrap_err();
    }
}
