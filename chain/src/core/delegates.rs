use log::debug;
use tokio::sync::RwLock;

use ldpos_common::{account::Delegate, time::TimestampMillis};

use crate::{
    dal::{DelegateProvider, SortOrder},
    error::ChainError,
};

// Cache of the top forgerCount delegates by descending vote weight.
// Rebuilt at the end of every processed block; read by slot scheduling,
// block verification and signature verification.
pub struct ActiveDelegates {
    forger_count: usize,
    forging_interval: TimestampMillis,
    set: RwLock<Vec<Delegate>>,
}

impl ActiveDelegates {
    pub fn new(forger_count: usize, forging_interval: TimestampMillis) -> Self {
        ActiveDelegates {
            forger_count,
            forging_interval,
            set: RwLock::new(Vec::new()),
        }
    }

    pub async fn refresh<P: DelegateProvider + ?Sized>(
        &self,
        provider: &P,
    ) -> Result<(), ChainError> {
        let delegates = provider
            .get_delegates_by_vote_weight(0, self.forger_count, SortOrder::Desc)
            .await?;
        debug!("Refreshed active delegate set with {} entries", delegates.len());
        *self.set.write().await = delegates;
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<Delegate> {
        self.set.read().await.clone()
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.set
            .read()
            .await
            .iter()
            .any(|delegate| delegate.address == address)
    }

    // The delegate that owns the slot containing the given timestamp
    pub async fn forger_for_timestamp(&self, timestamp: TimestampMillis) -> Option<Delegate> {
        let set = self.set.read().await;
        if set.is_empty() {
            return None;
        }
        let slot = timestamp / self.forging_interval;
        Some(set[(slot % set.len() as u64) as usize].clone())
    }
}

// Pure form of the rotation, used where the caller already holds a
// snapshot of the active set
pub fn forger_for_timestamp<'a>(
    active: &'a [Delegate],
    forging_interval: TimestampMillis,
    timestamp: TimestampMillis,
) -> Option<&'a Delegate> {
    if active.is_empty() {
        return None;
    }
    let slot = timestamp / forging_interval;
    Some(&active[(slot % active.len() as u64) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::{AccountProvider, Dal, MemoryDal};
    use ldpos_common::{account::Account, amount::Amount, genesis::Genesis};

    fn delegate(address: &str, weight: u64) -> Delegate {
        Delegate {
            address: address.to_string(),
            vote_weight: Amount::from_u64(weight),
            update_height: None,
        }
    }

    #[test]
    fn test_rotation_wraps_by_slot() {
        let active = vec![delegate("a", 3), delegate("b", 2), delegate("c", 1)];
        assert_eq!(forger_for_timestamp(&active, 30_000, 0).unwrap().address, "a");
        assert_eq!(
            forger_for_timestamp(&active, 30_000, 30_000).unwrap().address,
            "b"
        );
        assert_eq!(
            forger_for_timestamp(&active, 30_000, 90_000).unwrap().address,
            "a"
        );
        assert!(forger_for_timestamp(&[], 30_000, 0).is_none());
    }

    #[tokio::test]
    async fn test_refresh_takes_top_by_weight_with_address_ties() {
        let dal = MemoryDal::new();
        dal.init(&Genesis {
            network_symbol: "ldpos".to_string(),
            accounts: Vec::new(),
        })
        .await
        .unwrap();
        for (address, weight) in [("b", 10u64), ("a", 10), ("c", 30), ("d", 5)] {
            dal.upsert_account(&Account::new(address.to_string()))
                .await
                .unwrap();
            dal.upsert_delegate(&delegate(address, weight)).await.unwrap();
        }

        let active = ActiveDelegates::new(3, 30_000);
        active.refresh(&dal).await.unwrap();
        let snapshot = active.snapshot().await;
        let addresses: Vec<&str> = snapshot.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["c", "a", "b"]);
        assert!(active.contains("a").await);
        assert!(!active.contains("d").await);
    }
}
