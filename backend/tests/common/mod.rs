#![allow(dead_code)]

use std::sync::Arc;

use land_registry_dashboard::chain::{ConnectionManager, NetworkDescriptor};
use land_registry_dashboard::mock::{test_address, MockGateway, MockRegistry, MockWallet};
use land_registry_dashboard::models::{Address, Property, PropertyStatus};
use land_registry_dashboard::session::Session;
use land_registry_dashboard::units::parse_units;
use land_registry_dashboard::wallet::WalletProvider;

pub const CHAIN: u64 = 31337;

pub fn contract_address() -> Address {
    test_address(0xcc)
}

pub fn network() -> NetworkDescriptor {
    NetworkDescriptor {
        chain_id: CHAIN,
        chain_name: "Local Hardhat Network".into(),
        rpc_url: "http://127.0.0.1:8545".into(),
        currency_name: "Ether".into(),
        currency_symbol: "ETH".into(),
    }
}

pub struct Harness {
    pub wallet: Arc<MockWallet>,
    pub registry: MockRegistry,
    pub gateway: Arc<MockGateway>,
    pub session: Arc<Session>,
}

/// Session over `wallet`, with the registry deployed at [`contract_address`].
pub fn harness_with(wallet: MockWallet) -> Harness {
    let wallet = Arc::new(wallet.with_deployed_contract(contract_address()));
    let registry = MockRegistry::new(contract_address());
    let manager = ConnectionManager::new(
        Some(Arc::clone(&wallet) as Arc<dyn WalletProvider>),
        network(),
        &contract_address().to_string(),
    )
    .with_contract_factory(registry.factory());
    Harness {
        wallet,
        registry,
        gateway: Arc::new(MockGateway::new()),
        session: Arc::new(Session::new(manager)),
    }
}

pub fn harness(account: Address) -> Harness {
    harness_with(MockWallet::new(vec![account], CHAIN))
}

/// Harness already connected as `account`.
pub async fn connected(account: Address) -> Harness {
    let h = harness(account);
    h.session.connect().await.expect("connect");
    h
}

pub fn property(id: u64, owner: Address, status: PropertyStatus, value_eth: &str) -> Property {
    Property {
        id,
        state: "Karnataka".into(),
        district: "Bengaluru Urban".into(),
        village: format!("Village {}", id),
        survey_number: format!("SY-{}", id),
        owner,
        market_value: parse_units(value_eth).expect("value"),
        reference_id: format!("KA-{:04}", id),
        document_hash: None,
        status,
        registered_at: 1_700_000_000,
        last_updated: 1_700_000_000,
        is_active: true,
    }
}
