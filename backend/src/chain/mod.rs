//! Wallet connection and network negotiation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::abi::{from_hex, quantity};
use crate::config::AppConfig;
use crate::contract::{RegistryContract, RpcRegistry, DEFAULT_RECEIPT_POLLS};
use crate::error::{DashboardError, Result};
use crate::models::Address;
use crate::units::DECIMALS;
use crate::wallet::{
    parse_accounts, parse_chain_id, WalletProvider, INTERNAL_ERROR, UNRECOGNIZED_CHAIN,
};

/// Builds the contract handle for `(wallet, contract address, signer)`.
pub type ContractFactory =
    Arc<dyn Fn(Arc<dyn WalletProvider>, Address, Address) -> Arc<dyn RegistryContract> + Send + Sync>;

/// The network the registry is deployed on, as registered with a wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDescriptor {
    pub chain_id: u64,
    pub chain_name: String,
    pub rpc_url: String,
    pub currency_name: String,
    pub currency_symbol: String,
}

impl NetworkDescriptor {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            chain_name: config.chain_name.clone(),
            rpc_url: config.rpc_url.clone(),
            currency_name: config.currency_name.clone(),
            currency_symbol: config.currency_symbol.clone(),
        }
    }

    pub fn chain_id_hex(&self) -> String {
        quantity(u128::from(self.chain_id))
    }

    /// Parameters of `wallet_addEthereumChain`.
    pub fn add_chain_params(&self) -> Value {
        json!([{
            "chainId": self.chain_id_hex(),
            "chainName": self.chain_name,
            "nativeCurrency": {
                "name": self.currency_name,
                "symbol": self.currency_symbol,
                "decimals": DECIMALS,
            },
            "rpcUrls": [self.rpc_url],
            "blockExplorerUrls": [],
        }])
    }
}

/// A negotiated connection: the signing account and its contract handle.
#[derive(Clone)]
pub struct Connection {
    pub account: Address,
    /// Every account the wallet authorized, signer first.
    pub accounts: Vec<Address>,
    pub chain_id: u64,
    pub contract: Arc<dyn RegistryContract>,
}

pub struct ConnectionManager {
    wallet: Option<Arc<dyn WalletProvider>>,
    network: NetworkDescriptor,
    contract_address: String,
    factory: ContractFactory,
}

fn rpc_factory(receipt_poll: Duration, receipt_polls: u32) -> ContractFactory {
    Arc::new(move |wallet, address, signer| {
        Arc::new(
            RpcRegistry::new(wallet, address, signer)
                .with_receipt_poll(receipt_poll)
                .with_receipt_polls(receipt_polls),
        )
    })
}

impl ConnectionManager {
    /// `wallet` is `None` when no provider was injected.
    pub fn new(
        wallet: Option<Arc<dyn WalletProvider>>,
        network: NetworkDescriptor,
        contract_address: &str,
    ) -> Self {
        Self {
            wallet,
            network,
            contract_address: contract_address.to_string(),
            factory: rpc_factory(Duration::from_millis(500), DEFAULT_RECEIPT_POLLS),
        }
    }

    /// Receipt polling of the contract handles this manager builds.
    pub fn with_receipt_poll(mut self, interval: Duration, polls: u32) -> Self {
        self.factory = rpc_factory(interval, polls);
        self
    }

    pub fn with_contract_factory(mut self, factory: ContractFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn wallet(&self) -> Option<&Arc<dyn WalletProvider>> {
        self.wallet.as_ref()
    }

    pub fn network(&self) -> &NetworkDescriptor {
        &self.network
    }

    fn require_wallet(&self) -> Result<&Arc<dyn WalletProvider>> {
        self.wallet.as_ref().ok_or(DashboardError::NoWallet)
    }

    /// Accounts already authorized for this site, read without prompting.
    pub async fn authorized_accounts(&self) -> Result<Vec<Address>> {
        let wallet = self.require_wallet()?;
        let accounts = wallet.request("eth_accounts", json!([])).await?;
        Ok(parse_accounts(&accounts)?)
    }

    pub async fn connect(&self) -> Result<Connection> {
        let wallet = self.require_wallet()?;

        let contract_address: Address = self
            .contract_address
            .parse()
            .map_err(|_| DashboardError::ContractNotDeployed(self.contract_address.clone()))?;
        if contract_address.is_zero() {
            return Err(DashboardError::ContractNotDeployed(self.contract_address.clone()));
        }

        let accounts = match wallet.request("eth_requestAccounts", json!([])).await {
            Ok(value) => parse_accounts(&value)?,
            Err(e) if e.is_user_rejection() => {
                return Err(DashboardError::UserRejected(
                    "the connection request was declined".into(),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let account = *accounts.first().ok_or(DashboardError::NoAccounts)?;

        let chain_id = self.ensure_network(wallet.as_ref()).await?;

        let code = wallet
            .request("eth_getCode", json!([contract_address.to_string(), "latest"]))
            .await?;
        let code = code.as_str().map(from_hex).transpose()?.unwrap_or_default();
        if code.is_empty() {
            return Err(DashboardError::ContractNotDeployed(contract_address.to_string()));
        }

        let contract = (self.factory)(Arc::clone(wallet), contract_address, account);
        log::info!("Connected {} on chain {}", account, chain_id);
        Ok(Connection {
            account,
            accounts,
            chain_id,
            contract,
        })
    }

    /// Switches the wallet to the registry's network, adding it first if the
    /// wallet does not know it. Returns the chain id the wallet ends up on.
    async fn ensure_network(&self, wallet: &dyn WalletProvider) -> Result<u64> {
        let expected = self.network.chain_id;
        let current = parse_chain_id(&wallet.request("eth_chainId", json!([])).await?)?;
        if current == expected {
            return Ok(current);
        }

        log::info!("Wallet is on chain {}, switching to {}", current, expected);
        let switch = wallet
            .request(
                "wallet_switchEthereumChain",
                json!([{ "chainId": self.network.chain_id_hex() }]),
            )
            .await;
        match switch {
            Ok(_) => {}
            Err(e) if e.code == UNRECOGNIZED_CHAIN || e.code == INTERNAL_ERROR => {
                log::info!("Chain {} unknown to wallet, adding it", expected);
                wallet
                    .request("wallet_addEthereumChain", self.network.add_chain_params())
                    .await
                    .map_err(|add| {
                        DashboardError::NetworkSwitch(format!(
                            "could not add {} (chain {}, RPC {}): {}",
                            self.network.chain_name, expected, self.network.rpc_url, add.message
                        ))
                    })?;
            }
            Err(e) if e.is_user_rejection() => {
                return Err(DashboardError::NetworkSwitch(
                    "the network switch was declined".into(),
                ))
            }
            Err(e) => return Err(DashboardError::NetworkSwitch(e.message)),
        }

        let actual = parse_chain_id(&wallet.request("eth_chainId", json!([])).await?)?;
        if actual != expected {
            return Err(DashboardError::NetworkMismatch { expected, actual });
        }
        Ok(actual)
    }
}
