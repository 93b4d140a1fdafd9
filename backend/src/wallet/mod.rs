//! Wallet provider seam.
//!
//! A [`WalletProvider`] is the injected request transport of a wallet:
//! JSON-RPC style `request(method, params)` plus a notification stream for
//! account and network changes. [`RpcWallet`] implements it over HTTP for
//! node-managed accounts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::abi::parse_quantity;
use crate::models::Address;

/// The user declined the request.
pub const USER_REJECTED: i64 = 4001;
/// The requested chain has not been added to the wallet.
pub const UNRECOGNIZED_CHAIN: i64 = 4902;
/// Generic internal error; some wallets report unknown chains with it.
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ProviderError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_user_rejection(&self) -> bool {
        self.code == USER_REJECTED
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for ProviderError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

/// Receiving end of a wallet's notifications.
///
/// Dropping the subscription unsubscribes it; the provider keeps no
/// reference to the consumer.
pub struct WalletSubscription {
    rx: broadcast::Receiver<WalletEvent>,
}

impl WalletSubscription {
    pub fn new(rx: broadcast::Receiver<WalletEvent>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the provider has gone away.
    /// Notifications missed because the consumer lagged are skipped.
    pub async fn next(&mut self) -> Option<WalletEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Wallet subscription lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError>;

    fn subscribe(&self) -> WalletSubscription;
}

/// Parses an account list result such as `["0xabc..."]`.
pub fn parse_accounts(value: &Value) -> Result<Vec<Address>, ProviderError> {
    let items = value
        .as_array()
        .ok_or_else(|| ProviderError::new(INTERNAL_ERROR, "account list is not an array"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .and_then(|s| s.parse::<Address>().ok())
                .ok_or_else(|| ProviderError::new(INTERNAL_ERROR, format!("invalid account {}", item)))
        })
        .collect()
}

/// Parses a hex chain id result such as `"0x7a69"`.
pub fn parse_chain_id(value: &Value) -> Result<u64, ProviderError> {
    value
        .as_str()
        .and_then(|s| parse_quantity(s).ok())
        .and_then(|id| u64::try_from(id).ok())
        .ok_or_else(|| ProviderError::new(INTERNAL_ERROR, format!("invalid chain id {}", value)))
}

/// JSON-RPC over HTTP against a node that manages its own accounts.
///
/// Node accounts are always authorized, so `eth_requestAccounts` is served
/// by `eth_accounts`. Changes are detected by [`RpcWallet::spawn_watcher`].
pub struct RpcWallet {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    events: broadcast::Sender<WalletEvent>,
}

impl RpcWallet {
    pub fn new(url: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id});
        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::new(INTERNAL_ERROR, format!("{} failed: {}", method, e)))?;
        let mut body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::new(INTERNAL_ERROR, format!("{} returned invalid JSON: {}", method, e)))?;

        if let Some(error) = body.get_mut("error").map(Value::take).filter(|e| !e.is_null()) {
            return Err(serde_json::from_value(error.clone())
                .unwrap_or_else(|_| ProviderError::new(INTERNAL_ERROR, error.to_string())));
        }
        Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    /// Polls accounts and chain id, publishing a [`WalletEvent`] whenever
    /// either changes. The task ends when the returned handle is aborted.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let wallet = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_accounts: Option<Vec<Address>> = None;
            let mut last_chain: Option<u64> = None;
            loop {
                ticker.tick().await;
                match wallet.send("eth_accounts", json!([])).await.and_then(|v| parse_accounts(&v)) {
                    Ok(accounts) => {
                        if last_accounts.as_ref().is_some_and(|prev| *prev != accounts) {
                            let _ = wallet.events.send(WalletEvent::AccountsChanged(accounts.clone()));
                        }
                        last_accounts = Some(accounts);
                    }
                    Err(e) => log::warn!("Wallet watcher could not read accounts: {}", e),
                }
                match wallet.send("eth_chainId", json!([])).await.and_then(|v| parse_chain_id(&v)) {
                    Ok(chain) => {
                        if last_chain.is_some_and(|prev| prev != chain) {
                            let _ = wallet.events.send(WalletEvent::ChainChanged(chain));
                        }
                        last_chain = Some(chain);
                    }
                    Err(e) => log::warn!("Wallet watcher could not read chain id: {}", e),
                }
            }
        })
    }
}

#[async_trait]
impl WalletProvider for RpcWallet {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let method = match method {
            "eth_requestAccounts" => "eth_accounts",
            other => other,
        };
        self.send(method, params).await
    }

    fn subscribe(&self) -> WalletSubscription {
        WalletSubscription::new(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_account_lists() {
        let accounts = parse_accounts(&json!(["0x00000000000000000000000000000000000000AA"])).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].to_string(), "0x00000000000000000000000000000000000000aa");
        assert!(parse_accounts(&json!("0xabc")).is_err());
        assert!(parse_accounts(&json!(["nope"])).is_err());
    }

    #[test]
    fn parses_chain_ids() {
        assert_eq!(parse_chain_id(&json!("0x7a69")).unwrap(), 31337);
        assert!(parse_chain_id(&json!(1)).is_err());
    }

    #[test]
    fn provider_errors_deserialize_from_rpc_bodies() {
        let err: ProviderError =
            serde_json::from_value(json!({"code": 4001, "message": "User rejected the request."}))
                .unwrap();
        assert!(err.is_user_rejection());
        assert_eq!(err.data, None);
    }

    #[tokio::test]
    async fn subscription_ends_when_provider_is_dropped() {
        let (tx, rx) = broadcast::channel(4);
        let mut sub = WalletSubscription::new(rx);
        tx.send(WalletEvent::ChainChanged(1)).unwrap();
        drop(tx);
        assert_eq!(sub.next().await, Some(WalletEvent::ChainChanged(1)));
        assert_eq!(sub.next().await, None);
    }
}
