use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ldpos_common::time::{get_current_time_in_millis, TimestampMillis};

// Maps wall-clock time onto fixed-width forging slots. All waits poll;
// deactivating the module falls through at the next poll.
#[derive(Debug, Clone)]
pub struct SlotClock {
    forging_interval: TimestampMillis,
    time_poll_interval: TimestampMillis,
}

impl SlotClock {
    pub fn new(forging_interval: TimestampMillis, time_poll_interval: TimestampMillis) -> Self {
        SlotClock {
            forging_interval,
            time_poll_interval,
        }
    }

    pub fn forging_interval(&self) -> TimestampMillis {
        self.forging_interval
    }

    pub fn slot_index(&self, timestamp: TimestampMillis) -> u64 {
        timestamp / self.forging_interval
    }

    pub fn slot_timestamp(&self, slot: u64) -> TimestampMillis {
        slot * self.forging_interval
    }

    pub fn current_slot(&self) -> u64 {
        self.slot_index(get_current_time_in_millis())
    }

    pub fn is_slot_aligned(&self, timestamp: TimestampMillis) -> bool {
        timestamp % self.forging_interval == 0
    }

    // Poll until the slot index advances past the one we entered with.
    // Returns the new slot's timestamp, or None once deactivated.
    pub async fn wait_until_next_block_time_slot(
        &self,
        active: &AtomicBool,
    ) -> Option<TimestampMillis> {
        let entry_slot = self.current_slot();
        loop {
            if !active.load(Ordering::SeqCst) {
                return None;
            }
            let slot = self.current_slot();
            if slot > entry_slot {
                return Some(self.slot_timestamp(slot));
            }
            tokio::time::sleep(Duration::from_millis(self.time_poll_interval)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_arithmetic() {
        let clock = SlotClock::new(30_000, 200);
        assert_eq!(clock.slot_index(0), 0);
        assert_eq!(clock.slot_index(29_999), 0);
        assert_eq!(clock.slot_index(30_000), 1);
        assert_eq!(clock.slot_timestamp(7), 210_000);
        assert!(clock.is_slot_aligned(60_000));
        assert!(!clock.is_slot_aligned(60_001));
    }

    #[tokio::test]
    async fn test_wait_falls_through_on_deactivation() {
        let clock = SlotClock::new(3_600_000_000, 1);
        let active = AtomicBool::new(false);
        assert_eq!(clock.wait_until_next_block_time_slot(&active).await, None);
    }
}
