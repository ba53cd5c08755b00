// Shared fixtures for the unit tests: a node wired to the in-memory DAL,
// the scriptable network channel and deterministic sim crypto clients.

use std::sync::Arc;

use ldpos_common::{
    amount::Amount,
    block::Block,
    crypto::{CryptoClient, KeyType, SimCryptoClient, SimCryptoVerifier},
    genesis::{Genesis, GenesisAccount},
    transaction::{Transaction, TransactionPayload},
};

use crate::{
    config::{ChainConfig, MinTransactionFees},
    dal::MemoryDal,
    network::MemoryNetwork,
    ChainModule,
};

pub(crate) struct TestNode {
    pub module: Arc<ChainModule<MemoryDal>>,
    pub network: Arc<MemoryNetwork>,
    pub forgers: Vec<Arc<SimCryptoClient>>,
    pub genesis: Genesis,
}

pub(crate) fn low_fee_config() -> ChainConfig {
    ChainConfig {
        min_transaction_fees: MinTransactionFees {
            transfer: Amount::from_u64(1),
            vote: Amount::from_u64(1),
            unvote: Amount::from_u64(1),
            register_sig_details: Amount::from_u64(1),
            register_multisig_details: Amount::from_u64(1),
            register_forging_details: Amount::from_u64(1),
            register_multisig_wallet: Amount::from_u64(1),
        },
        min_multisig_registration_fee_per_member: Amount::from_u64(1),
        min_multisig_transaction_fee_per_member: Amount::from_u64(1),
        ..ChainConfig::default()
    }
}

pub(crate) fn delegate_genesis_account(
    client: &SimCryptoClient,
    balance: u64,
) -> GenesisAccount {
    GenesisAccount {
        address: client.wallet_address().to_string(),
        account_type: ldpos_common::account::AccountType::Sig,
        balance: Amount::from_u64(balance),
        sig_public_key: Some(client.public_key(KeyType::Sig, 0)),
        next_sig_public_key: Some(client.next_public_key(KeyType::Sig, 0)),
        next_sig_key_index: Some(0),
        forging_public_key: Some(client.public_key(KeyType::Forging, 0)),
        next_forging_public_key: Some(client.next_public_key(KeyType::Forging, 0)),
        next_forging_key_index: Some(0),
        multisig_public_key: None,
        next_multisig_public_key: None,
        next_multisig_key_index: None,
        votes: vec![client.wallet_address().to_string()],
    }
}

pub(crate) fn plain_genesis_account(address: &str, balance: u64) -> GenesisAccount {
    GenesisAccount {
        address: address.to_string(),
        account_type: ldpos_common::account::AccountType::Sig,
        balance: Amount::from_u64(balance),
        sig_public_key: None,
        next_sig_public_key: None,
        next_sig_key_index: None,
        forging_public_key: None,
        next_forging_public_key: None,
        next_forging_key_index: None,
        multisig_public_key: None,
        next_multisig_public_key: None,
        next_multisig_key_index: None,
        votes: Vec::new(),
    }
}

// A node whose delegates are sim clients named delegate-1..N, each
// voting for itself with the given balance. The module is created but
// not started: tests drive the components directly.
pub(crate) async fn build_node(
    delegate_count: usize,
    delegate_balance: u64,
    extra_accounts: Vec<GenesisAccount>,
    config: ChainConfig,
) -> TestNode {
    let forgers: Vec<Arc<SimCryptoClient>> = (1..=delegate_count)
        .map(|i| Arc::new(SimCryptoClient::new("ldpos", &format!("delegate-{}", i))))
        .collect();

    let mut accounts: Vec<GenesisAccount> = forgers
        .iter()
        .map(|client| delegate_genesis_account(client, delegate_balance))
        .collect();
    accounts.extend(extra_accounts);

    let genesis = Genesis {
        network_symbol: config.network_symbol.clone(),
        accounts,
    };

    let network = Arc::new(MemoryNetwork::new());
    let clients: Vec<Arc<dyn CryptoClient>> = forgers
        .iter()
        .map(|client| client.clone() as Arc<dyn CryptoClient>)
        .collect();
    let module = ChainModule::create(
        Arc::new(MemoryDal::new()),
        network.clone(),
        Arc::new(SimCryptoVerifier),
        clients,
        config,
        genesis.clone(),
    )
    .await
    .unwrap();

    TestNode {
        module,
        network,
        forgers,
        genesis,
    }
}

pub(crate) fn unsigned_transfer(
    sender: &str,
    recipient: &str,
    amount: u64,
    fee: u64,
    timestamp: u64,
) -> Transaction {
    Transaction {
        id: String::new(),
        sender_address: sender.to_string(),
        fee: Amount::from_u64(fee),
        timestamp,
        payload: TransactionPayload::Transfer {
            amount: Amount::from_u64(amount),
            recipient_address: recipient.to_string(),
            message: None,
        },
        sig_public_key: None,
        next_sig_public_key: None,
        next_sig_key_index: None,
        sender_signature: None,
        sender_signature_hash: None,
        signatures: Vec::new(),
        block_id: None,
    }
}

pub(crate) fn unsigned_payload(
    sender: &str,
    payload: TransactionPayload,
    fee: u64,
    timestamp: u64,
) -> Transaction {
    Transaction {
        id: String::new(),
        sender_address: sender.to_string(),
        fee: Amount::from_u64(fee),
        timestamp,
        payload,
        sig_public_key: None,
        next_sig_public_key: None,
        next_sig_key_index: None,
        sender_signature: None,
        sender_signature_hash: None,
        signatures: Vec::new(),
        block_id: None,
    }
}

// Forge the next block on top of the given tip, with the transactions
// already in simplified form
pub(crate) async fn forge_next_block(
    forger: &SimCryptoClient,
    tip: &Block,
    forging_interval: u64,
    transactions: Vec<Transaction>,
) -> Block {
    forger
        .prepare_block(Block {
            id: String::new(),
            height: tip.height + 1,
            timestamp: tip.timestamp + forging_interval,
            previous_block_id: Some(tip.id.clone()),
            forger_address: String::new(),
            forging_public_key: String::new(),
            next_forging_public_key: String::new(),
            next_forging_key_index: 0,
            transactions: transactions.iter().map(Transaction::simplify).collect(),
            forger_signature: None,
            signatures: Vec::new(),
        })
        .await
        .unwrap()
}
