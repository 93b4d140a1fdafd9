//! Session context: the connected account and its contract handle.
//!
//! A [`Session`] is constructed by the application root and shared with
//! every view. It moves through `Disconnected -> Connecting -> Connected`,
//! reacts to wallet notifications once [`Session::start`] has been called,
//! and bumps an epoch whenever the account or network behind the handle
//! changes so views can drop completions that belong to the old one.

use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::chain::{Connection, ConnectionManager};
use crate::contract::RegistryContract;
use crate::error::{DashboardError, Result};
use crate::models::Address;
use crate::units::format_address;
use crate::wallet::WalletEvent;

/// Role shown when the registry has none on record for the account.
pub const DEFAULT_ROLE: &str = "Property Owner";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Point-in-time copy of the session.
#[derive(Clone)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub account: Option<Address>,
    pub chain_id: Option<u64>,
    pub role: Option<String>,
    pub contract: Option<Arc<dyn RegistryContract>>,
    pub epoch: u64,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.contract.is_some()
    }

    /// Account and contract handle, or `NotConnected`.
    pub fn require(&self) -> Result<(Address, Arc<dyn RegistryContract>)> {
        match (&self.account, &self.contract) {
            (Some(account), Some(contract)) if self.status == ConnectionStatus::Connected => {
                Ok((*account, Arc::clone(contract)))
            }
            _ => Err(DashboardError::NotConnected),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            status: self.status,
            is_connected: self.is_connected(),
            account: self.account,
            short_account: self.account.map(|a| format_address(&a.to_string())),
            chain_id: self.chain_id,
            role: self.role.clone(),
            contract: self.contract.as_ref().map(|c| c.address()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub status: ConnectionStatus,
    pub is_connected: bool,
    pub account: Option<Address>,
    pub short_account: Option<String>,
    pub chain_id: Option<u64>,
    pub role: Option<String>,
    pub contract: Option<Address>,
}

struct SessionState {
    status: ConnectionStatus,
    connection: Option<Connection>,
    role: Option<String>,
    // Last values reported by the wallet, used to drop repeated notifications.
    last_accounts: Option<Vec<Address>>,
    last_chain: Option<u64>,
    epoch: u64,
    // Bumped by every reset; a connect only commits if it is unchanged.
    generation: u64,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            account: self.connection.as_ref().map(|c| c.account),
            chain_id: self.connection.as_ref().map(|c| c.chain_id),
            role: self.role.clone(),
            contract: self.connection.as_ref().map(|c| Arc::clone(&c.contract)),
            epoch: self.epoch,
        }
    }

    fn clear(&mut self) {
        if self.connection.take().is_some() {
            self.epoch += 1;
        }
        self.generation += 1;
        self.status = ConnectionStatus::Disconnected;
        self.role = None;
    }
}

pub struct Session {
    manager: ConnectionManager,
    state: RwLock<SessionState>,
    connecting: Mutex<()>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            state: RwLock::new(SessionState {
                status: ConnectionStatus::Disconnected,
                connection: None,
                role: None,
                last_accounts: None,
                last_chain: None,
                epoch: 0,
                generation: 0,
            }),
            connecting: Mutex::new(()),
            listener: StdMutex::new(None),
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.state.read().await.snapshot()
    }

    pub async fn epoch(&self) -> u64 {
        self.state.read().await.epoch
    }

    /// Connects, or joins the attempt already in flight.
    ///
    /// A caller that finds an attempt running waits for it and reports its
    /// outcome instead of prompting the wallet a second time.
    ///
    /// If that attempt is discarded by a reset that happened before this
    /// caller arrived, the caller connects on its own.
    pub async fn connect(&self) -> Result<SessionSnapshot> {
        let entered = self.state.read().await.generation;
        match self.connecting.try_lock() {
            Ok(_attempt) => self.connect_now().await,
            Err(_) => {
                log::info!("Connect already in progress, waiting for it");
                let _attempt = self.connecting.lock().await;
                let (snapshot, generation) = {
                    let state = self.state.read().await;
                    (state.snapshot(), state.generation)
                };
                if snapshot.is_connected() {
                    Ok(snapshot)
                } else if generation == entered {
                    self.connect_now().await
                } else {
                    Err(DashboardError::NotConnected)
                }
            }
        }
    }

    async fn connect_now(&self) -> Result<SessionSnapshot> {
        let generation = {
            let mut state = self.state.write().await;
            state.status = ConnectionStatus::Connecting;
            state.generation
        };

        let connection = match self.manager.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                log::warn!("Connect failed: {}", e);
                let mut state = self.state.write().await;
                if state.generation == generation {
                    state.clear();
                }
                return Err(e);
            }
        };
        let role = self.read_role(&connection).await;

        let mut state = self.state.write().await;
        if state.generation != generation {
            log::info!(
                "Session was reset while connecting {}, discarding the connection",
                connection.account
            );
            return Err(DashboardError::SessionChanged);
        }
        let same_signer = state
            .connection
            .as_ref()
            .is_some_and(|c| c.account == connection.account && c.chain_id == connection.chain_id);
        if !same_signer {
            state.epoch += 1;
        }
        state.last_accounts = Some(connection.accounts.clone());
        state.last_chain = Some(connection.chain_id);
        state.status = ConnectionStatus::Connected;
        state.role = Some(role);
        state.connection = Some(connection);
        Ok(state.snapshot())
    }

    async fn read_role(&self, connection: &Connection) -> String {
        match connection.contract.user_role(connection.account).await {
            Ok(role) if !role.is_empty() => role,
            Ok(_) => DEFAULT_ROLE.to_string(),
            Err(e) => {
                log::warn!("Could not read role of {}: {}", connection.account, e);
                DEFAULT_ROLE.to_string()
            }
        }
    }

    /// Drops the account and contract handle. Wallet authorization is untouched.
    pub async fn disconnect(&self) -> SessionSnapshot {
        let mut state = self.state.write().await;
        if let Some(connection) = &state.connection {
            log::info!("Disconnected {}", connection.account);
        }
        state.clear();
        state.snapshot()
    }

    /// Connects silently when the wallet already authorized an account.
    /// Nothing is prompted otherwise; a missing wallet leaves the session
    /// disconnected.
    pub async fn init(&self) -> Result<SessionSnapshot> {
        let accounts = match self.manager.authorized_accounts().await {
            Ok(accounts) => accounts,
            Err(DashboardError::NoWallet) => {
                log::info!("No wallet provider, staying disconnected");
                return Ok(self.snapshot().await);
            }
            Err(e) => return Err(e),
        };
        if accounts.is_empty() {
            let mut state = self.state.write().await;
            state.last_accounts = Some(accounts);
            return Ok(state.snapshot());
        }
        self.connect().await
    }

    /// Applies one wallet notification. Repeats of the last reported value
    /// are ignored.
    pub async fn handle_event(&self, event: WalletEvent) -> Result<()> {
        match event {
            WalletEvent::AccountsChanged(accounts) => {
                {
                    let mut state = self.state.write().await;
                    if state.last_accounts.as_ref() == Some(&accounts) {
                        log::debug!("Ignoring repeated accounts notification");
                        return Ok(());
                    }
                    state.last_accounts = Some(accounts.clone());
                }
                if accounts.is_empty() {
                    log::info!("Wallet reports no accounts");
                    self.disconnect().await;
                    return Ok(());
                }
                log::info!("Accounts changed, reconnecting as {}", accounts[0]);
                self.connect().await.map(|_| ())
            }
            WalletEvent::ChainChanged(chain_id) => {
                {
                    let mut state = self.state.write().await;
                    if state.last_chain == Some(chain_id) {
                        log::debug!("Ignoring repeated chain notification");
                        return Ok(());
                    }
                    state.last_chain = Some(chain_id);
                    log::warn!("Network changed to chain {}, resetting session", chain_id);
                    state.clear();
                    // Views started before the switch are stale even if nothing was connected.
                    state.epoch += 1;
                }
                self.init().await.map(|_| ())
            }
        }
    }

    /// Subscribes to the wallet's notifications for the lifetime of the session.
    pub fn start(self: &Arc<Self>) {
        let Some(wallet) = self.manager.wallet() else {
            log::info!("No wallet provider, not listening for wallet events");
            return;
        };
        let mut subscription = wallet.subscribe();
        let session = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                if let Err(e) = session.handle_event(event).await {
                    log::warn!("Wallet event handling failed: {}", e);
                }
            }
        });
        let mut listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = listener.replace(task) {
            previous.abort();
        }
    }

    /// Stops listening for wallet events and drops the connection.
    pub async fn shutdown(&self) {
        self.stop_listener();
        self.disconnect().await;
    }

    fn stop_listener(&self) {
        let task = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_listener();
    }
}
