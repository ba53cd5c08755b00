use serde::{Deserialize, Serialize};

use ldpos_common::{amount::Amount, time::TimestampMillis, transaction::TransactionPayload};

use crate::error::ChainError;

fn default_module_alias() -> String {
    "ldpos_chain".to_string()
}
fn default_network_symbol() -> String {
    "ldpos".to_string()
}
fn default_forging_interval() -> TimestampMillis {
    30_000
}
fn default_forger_count() -> usize {
    21
}
fn default_min_forger_block_signature_ratio() -> f64 {
    0.6
}
fn default_block_signatures_to_provide() -> usize {
    12
}
fn default_block_signatures_to_fetch() -> usize {
    12
}
fn default_block_signatures_indicator() -> String {
    "bsi".to_string()
}
fn default_fetch_block_limit() -> usize {
    10
}
fn default_fetch_block_pause() -> TimestampMillis {
    100
}
fn default_fetch_block_end_confirmations() -> usize {
    10
}
fn default_forging_block_broadcast_delay() -> TimestampMillis {
    2_000
}
fn default_forging_signature_broadcast_delay() -> TimestampMillis {
    5_000
}
fn default_true() -> bool {
    true
}
fn default_propagation_timeout() -> TimestampMillis {
    15_000
}
fn default_propagation_randomness() -> TimestampMillis {
    3_000
}
fn default_time_poll_interval() -> TimestampMillis {
    200
}
fn default_min_transactions_per_block() -> usize {
    1
}
fn default_max_transactions_per_block() -> usize {
    300
}
fn default_min_multisig_members() -> usize {
    1
}
fn default_max_multisig_members() -> usize {
    100
}
fn default_min_multisig_registration_fee_per_member() -> Amount {
    "100000000".parse().unwrap()
}
fn default_min_multisig_transaction_fee_per_member() -> Amount {
    "500000".parse().unwrap()
}
fn default_pending_transaction_expiry() -> TimestampMillis {
    86_400_000 // 24 hours
}
fn default_pending_transaction_expiry_check_interval() -> TimestampMillis {
    3_600_000 // 1 hour
}
fn default_max_spendable_digits() -> usize {
    25
}
fn default_max_transaction_message_length() -> usize {
    256
}
fn default_max_votes_per_account() -> usize {
    5
}
fn default_max_transaction_backpressure_per_account() -> usize {
    32
}
fn default_max_pending_transactions_per_account() -> usize {
    64
}
fn default_max_consecutive_block_fetch_failures() -> usize {
    5
}
fn default_max_consecutive_transaction_fetch_failures() -> usize {
    3
}
fn default_catch_up_consensus_poll_count() -> usize {
    6
}
fn default_catch_up_consensus_min_ratio() -> f64 {
    0.5
}
fn default_api_limit() -> usize {
    100
}
fn default_max_public_api_limit() -> usize {
    100
}
fn default_max_public_api_offset() -> usize {
    10_000
}
fn default_max_private_api_limit() -> usize {
    1_000
}
fn default_max_private_api_offset() -> usize {
    100_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropagationMode {
    Broadcast,
    None,
}

impl Default for PropagationMode {
    fn default() -> Self {
        PropagationMode::Broadcast
    }
}

// Minimum fee schedule per transaction type, decimal string amounts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinTransactionFees {
    #[serde(default = "fee_transfer")]
    pub transfer: Amount,
    #[serde(default = "fee_vote")]
    pub vote: Amount,
    #[serde(default = "fee_vote")]
    pub unvote: Amount,
    #[serde(default = "fee_register")]
    pub register_sig_details: Amount,
    #[serde(default = "fee_register")]
    pub register_multisig_details: Amount,
    #[serde(default = "fee_register")]
    pub register_forging_details: Amount,
    #[serde(default = "fee_register_wallet")]
    pub register_multisig_wallet: Amount,
}

fn fee_transfer() -> Amount {
    "10000000".parse().unwrap()
}
fn fee_vote() -> Amount {
    "20000000".parse().unwrap()
}
fn fee_register() -> Amount {
    "40000000".parse().unwrap()
}
fn fee_register_wallet() -> Amount {
    "50000000".parse().unwrap()
}

impl Default for MinTransactionFees {
    fn default() -> Self {
        MinTransactionFees {
            transfer: fee_transfer(),
            vote: fee_vote(),
            unvote: fee_vote(),
            register_sig_details: fee_register(),
            register_multisig_details: fee_register(),
            register_forging_details: fee_register(),
            register_multisig_wallet: fee_register_wallet(),
        }
    }
}

impl MinTransactionFees {
    pub fn for_payload(&self, payload: &TransactionPayload) -> Amount {
        match payload {
            TransactionPayload::Transfer { .. } => self.transfer,
            TransactionPayload::Vote { .. } => self.vote,
            TransactionPayload::Unvote { .. } => self.unvote,
            TransactionPayload::RegisterSigDetails { .. } => self.register_sig_details,
            TransactionPayload::RegisterMultisigDetails { .. } => self.register_multisig_details,
            TransactionPayload::RegisterForgingDetails { .. } => self.register_forging_details,
            TransactionPayload::RegisterMultisigWallet { .. } => self.register_multisig_wallet,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainConfig {
    pub module_alias: String,
    pub network_symbol: String,

    pub forging_interval: TimestampMillis,
    pub forger_count: usize,
    pub min_forger_block_signature_ratio: f64,
    pub block_signatures_to_provide: usize,
    pub block_signatures_to_fetch: usize,
    pub block_signatures_indicator: String,

    pub fetch_block_limit: usize,
    pub fetch_block_pause: TimestampMillis,
    pub fetch_block_end_confirmations: usize,

    pub forging_block_broadcast_delay: TimestampMillis,
    pub forging_signature_broadcast_delay: TimestampMillis,
    pub auto_sync_forging_key_index: bool,

    pub propagation_timeout: TimestampMillis,
    pub propagation_randomness: TimestampMillis,
    pub propagation_mode: PropagationMode,
    pub time_poll_interval: TimestampMillis,

    pub min_transactions_per_block: usize,
    pub max_transactions_per_block: usize,

    pub min_multisig_members: usize,
    pub max_multisig_members: usize,
    pub min_multisig_registration_fee_per_member: Amount,
    pub min_multisig_transaction_fee_per_member: Amount,

    pub pending_transaction_expiry: TimestampMillis,
    pub pending_transaction_expiry_check_interval: TimestampMillis,

    pub max_spendable_digits: usize,
    pub max_transaction_message_length: usize,
    pub max_votes_per_account: usize,
    pub max_transaction_backpressure_per_account: usize,
    pub max_pending_transactions_per_account: usize,

    pub max_consecutive_block_fetch_failures: usize,
    pub max_consecutive_transaction_fetch_failures: usize,
    pub catch_up_consensus_poll_count: usize,
    pub catch_up_consensus_min_ratio: f64,

    pub api_limit: usize,
    pub max_public_api_limit: usize,
    pub max_public_api_offset: usize,
    pub max_private_api_limit: usize,
    pub max_private_api_offset: usize,

    pub min_transaction_fees: MinTransactionFees,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            module_alias: default_module_alias(),
            network_symbol: default_network_symbol(),
            forging_interval: default_forging_interval(),
            forger_count: default_forger_count(),
            min_forger_block_signature_ratio: default_min_forger_block_signature_ratio(),
            block_signatures_to_provide: default_block_signatures_to_provide(),
            block_signatures_to_fetch: default_block_signatures_to_fetch(),
            block_signatures_indicator: default_block_signatures_indicator(),
            fetch_block_limit: default_fetch_block_limit(),
            fetch_block_pause: default_fetch_block_pause(),
            fetch_block_end_confirmations: default_fetch_block_end_confirmations(),
            forging_block_broadcast_delay: default_forging_block_broadcast_delay(),
            forging_signature_broadcast_delay: default_forging_signature_broadcast_delay(),
            auto_sync_forging_key_index: default_true(),
            propagation_timeout: default_propagation_timeout(),
            propagation_randomness: default_propagation_randomness(),
            propagation_mode: PropagationMode::default(),
            time_poll_interval: default_time_poll_interval(),
            min_transactions_per_block: default_min_transactions_per_block(),
            max_transactions_per_block: default_max_transactions_per_block(),
            min_multisig_members: default_min_multisig_members(),
            max_multisig_members: default_max_multisig_members(),
            min_multisig_registration_fee_per_member:
                default_min_multisig_registration_fee_per_member(),
            min_multisig_transaction_fee_per_member:
                default_min_multisig_transaction_fee_per_member(),
            pending_transaction_expiry: default_pending_transaction_expiry(),
            pending_transaction_expiry_check_interval:
                default_pending_transaction_expiry_check_interval(),
            max_spendable_digits: default_max_spendable_digits(),
            max_transaction_message_length: default_max_transaction_message_length(),
            max_votes_per_account: default_max_votes_per_account(),
            max_transaction_backpressure_per_account:
                default_max_transaction_backpressure_per_account(),
            max_pending_transactions_per_account:
                default_max_pending_transactions_per_account(),
            max_consecutive_block_fetch_failures:
                default_max_consecutive_block_fetch_failures(),
            max_consecutive_transaction_fetch_failures:
                default_max_consecutive_transaction_fetch_failures(),
            catch_up_consensus_poll_count: default_catch_up_consensus_poll_count(),
            catch_up_consensus_min_ratio: default_catch_up_consensus_min_ratio(),
            api_limit: default_api_limit(),
            max_public_api_limit: default_max_public_api_limit(),
            max_public_api_offset: default_max_public_api_offset(),
            max_private_api_limit: default_max_private_api_limit(),
            max_private_api_offset: default_max_private_api_offset(),
            min_transaction_fees: MinTransactionFees::default(),
        }
    }
}

impl ChainConfig {
    // Misconfiguration here is fatal: the module refuses to load rather
    // than run with consensus-breaking parameters
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.min_forger_block_signature_ratio < 0.5 {
            return Err(ChainError::Config(format!(
                "minForgerBlockSignatureRatio was {} but must be at least 0.5",
                self.min_forger_block_signature_ratio
            )));
        }
        if self.block_signatures_to_fetch < self.block_signatures_to_provide {
            return Err(ChainError::Config(format!(
                "blockSignaturesToFetch ({}) must not be less than blockSignaturesToProvide ({})",
                self.block_signatures_to_fetch, self.block_signatures_to_provide
            )));
        }
        if self.forging_interval == 0 || self.time_poll_interval == 0 {
            return Err(ChainError::Config(
                "forgingInterval and timePollInterval must be positive".to_string(),
            ));
        }
        if self.forger_count == 0 {
            return Err(ChainError::Config("forgerCount must be positive".to_string()));
        }
        if self.min_multisig_members == 0 || self.max_multisig_members < self.min_multisig_members
        {
            return Err(ChainError::Config(
                "multisig member bounds were inconsistent".to_string(),
            ));
        }
        Ok(())
    }

    // Number of co-signatures a block needs before it can be processed
    pub fn required_block_signature_count(&self, active_delegate_count: usize) -> usize {
        (active_delegate_count as f64 * self.min_forger_block_signature_ratio).floor() as usize
    }

    // Capability flag advertised to peers, e.g. "bsi12"
    pub fn block_signatures_capability(&self) -> String {
        format!(
            "{}{}",
            self.block_signatures_indicator, self.block_signatures_to_fetch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ChainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.forging_interval, 30_000);
        assert_eq!(config.forger_count, 21);
        assert_eq!(config.block_signatures_capability(), "bsi12");
    }

    #[test]
    fn test_low_signature_ratio_is_fatal() {
        let config = ChainConfig {
            min_forger_block_signature_ratio: 0.4,
            ..ChainConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChainError::Config(_))));
    }

    #[test]
    fn test_fetch_below_provide_is_fatal() {
        let config = ChainConfig {
            block_signatures_to_fetch: 5,
            block_signatures_to_provide: 12,
            ..ChainConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChainError::Config(_))));
    }

    #[test]
    fn test_required_signature_count_floors() {
        let config = ChainConfig {
            forger_count: 5,
            min_forger_block_signature_ratio: 0.6,
            ..ChainConfig::default()
        };
        assert_eq!(config.required_block_signature_count(5), 3);
    }

    #[test]
    fn test_partial_config_takes_defaults() {
        let config: ChainConfig =
            serde_json::from_str(r#"{"forgerCount": 5, "networkSymbol": "clsk"}"#).unwrap();
        assert_eq!(config.forger_count, 5);
        assert_eq!(config.network_symbol, "clsk");
        assert_eq!(config.forging_interval, 30_000);
    }
}
