use serde::{Deserialize, Serialize};

use crate::amount::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountType {
    Sig,
    Multisig,
}

impl Default for AccountType {
    fn default() -> Self {
        AccountType::Sig
    }
}

// Account state as persisted by the DAL.
// For type = sig the multisig fields are unused, for type = multisig the
// sig fields are unused; members of a multisig wallet participate through
// their own accounts' multisig key chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub address: String,
    #[serde(rename = "type", default)]
    pub account_type: AccountType,
    #[serde(default)]
    pub balance: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_height: Option<u64>,

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

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_signature_count: Option<usize>,
}

impl Account {
    // Accounts come into existence lazily the first time a block
    // references them
    pub fn new(address: String) -> Self {
        Account {
            address,
            account_type: AccountType::Sig,
            balance: Amount::ZERO,
            update_height: None,
            sig_public_key: None,
            next_sig_public_key: None,
            next_sig_key_index: None,
            multisig_public_key: None,
            next_multisig_public_key: None,
            next_multisig_key_index: None,
            forging_public_key: None,
            next_forging_public_key: None,
            next_forging_key_index: None,
            required_signature_count: None,
        }
    }

    pub fn is_multisig(&self) -> bool {
        self.account_type == AccountType::Multisig
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegate {
    pub address: String,
    #[serde(default)]
    pub vote_weight: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_height: Option<u64>,
}

impl Delegate {
    pub fn new(address: String) -> Self {
        Delegate {
            address,
            vote_weight: Amount::ZERO,
            update_height: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub voter_address: String,
    pub delegate_address: String,
}
