use dotenv::dotenv;
use serde::Deserialize;

use crate::error::DashboardError;

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub contract_address: String,
    pub chain_id: u64,
    pub chain_name: String,
    pub rpc_url: String,
    pub currency_name: String,
    pub currency_symbol: String,
    pub gateway_api_url: String,
    pub gateway_url: String,
    pub port: u16,
    pub wallet_poll_ms: u64,
    pub receipt_poll_ms: u64,
    pub receipt_max_polls: u32,
}

impl AppConfig {
    pub fn load() -> Result<Self, DashboardError> {
        dotenv().ok(); // Load .env file if present
        let settings = config::Config::builder()
            .set_default("contract_address", "0x0000000000000000000000000000000000000000")?
            .set_default("chain_id", 31337)?
            .set_default("chain_name", "Local Hardhat Network")?
            .set_default("rpc_url", "http://127.0.0.1:8545")?
            .set_default("currency_name", "Ether")?
            .set_default("currency_symbol", "ETH")?
            .set_default("gateway_api_url", "http://127.0.0.1:5001/api/v0")?
            .set_default("gateway_url", "https://ipfs.io/ipfs/")?
            .set_default("port", 3000)?
            .set_default("wallet_poll_ms", 1000)?
            .set_default("receipt_poll_ms", 500)?
            .set_default("receipt_max_polls", 240)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
