//! In-memory wallet, registry and gateway for tests.
//!
//! [`MockRegistry`] applies a simplified version of the registry's rules so
//! views can be driven end to end without a chain.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::abi::{keccak256, parse_quantity, quantity};
use crate::chain::ContractFactory;
use crate::contract::{LogEntry, PendingTx, Receipt, RegistryCall, RegistryContract, RegistryEvent, Role};
use crate::error::{DashboardError, Result};
use crate::gateway::{join_url, StorageGateway};
use crate::models::{Address, Property, PropertyStatus, Transaction, TransactionStatus};
use crate::wallet::{
    ProviderError, WalletEvent, WalletProvider, WalletSubscription, UNRECOGNIZED_CHAIN,
    USER_REJECTED,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deterministic test address ending in `n`.
pub fn test_address(n: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[0] = 0xa0;
    bytes[19] = n;
    Address::from_bytes(bytes)
}

struct WalletState {
    accounts: Vec<Address>,
    authorized: bool,
    chain_id: u64,
    known_chains: HashSet<u64>,
    deployed: HashSet<Address>,
    reject_accounts: bool,
    reject_switch: bool,
    fail_add: bool,
    calls: Vec<String>,
}

pub struct MockWallet {
    state: Mutex<WalletState>,
    events: broadcast::Sender<WalletEvent>,
}

impl MockWallet {
    pub fn new(accounts: Vec<Address>, chain_id: u64) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(WalletState {
                accounts,
                authorized: false,
                chain_id,
                known_chains: HashSet::from([chain_id]),
                deployed: HashSet::new(),
                reject_accounts: false,
                reject_switch: false,
                fail_add: false,
                calls: Vec::new(),
            }),
            events,
        }
    }

    /// Accounts are visible to `eth_accounts` without a prompt.
    pub fn authorized(self) -> Self {
        lock(&self.state).authorized = true;
        self
    }

    pub fn with_known_chain(self, chain_id: u64) -> Self {
        lock(&self.state).known_chains.insert(chain_id);
        self
    }

    pub fn with_deployed_contract(self, address: Address) -> Self {
        lock(&self.state).deployed.insert(address);
        self
    }

    pub fn rejecting_accounts(self) -> Self {
        lock(&self.state).reject_accounts = true;
        self
    }

    pub fn rejecting_switch(self) -> Self {
        lock(&self.state).reject_switch = true;
        self
    }

    pub fn failing_add(self) -> Self {
        lock(&self.state).fail_add = true;
        self
    }

    /// Methods requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn count_calls(&self, method: &str) -> usize {
        lock(&self.state).calls.iter().filter(|m| *m == method).count()
    }

    /// Changes the account list and notifies subscribers.
    pub fn change_accounts(&self, accounts: Vec<Address>) {
        lock(&self.state).accounts = accounts.clone();
        let _ = self.events.send(WalletEvent::AccountsChanged(accounts));
    }

    /// Moves the wallet to another chain and notifies subscribers.
    pub fn change_chain(&self, chain_id: u64) {
        {
            let mut state = lock(&self.state);
            state.chain_id = chain_id;
            state.known_chains.insert(chain_id);
        }
        let _ = self.events.send(WalletEvent::ChainChanged(chain_id));
    }

    fn accounts_json(accounts: &[Address]) -> Value {
        Value::Array(accounts.iter().map(|a| Value::String(a.to_string())).collect())
    }

    fn requested_chain(params: &Value) -> Option<u64> {
        params[0]["chainId"]
            .as_str()
            .and_then(|s| parse_quantity(s).ok())
            .and_then(|id| u64::try_from(id).ok())
    }
}

#[async_trait]
impl WalletProvider for MockWallet {
    async fn request(&self, method: &str, params: Value) -> std::result::Result<Value, ProviderError> {
        let mut state = lock(&self.state);
        state.calls.push(method.to_string());
        match method {
            "eth_requestAccounts" => {
                if state.reject_accounts {
                    return Err(ProviderError::new(USER_REJECTED, "User rejected the request."));
                }
                state.authorized = true;
                Ok(Self::accounts_json(&state.accounts))
            }
            "eth_accounts" => {
                if state.authorized {
                    Ok(Self::accounts_json(&state.accounts))
                } else {
                    Ok(json!([]))
                }
            }
            "eth_chainId" => Ok(Value::String(quantity(u128::from(state.chain_id)))),
            "wallet_switchEthereumChain" => {
                if state.reject_switch {
                    return Err(ProviderError::new(USER_REJECTED, "User rejected the request."));
                }
                let chain = Self::requested_chain(&params)
                    .ok_or_else(|| ProviderError::new(-32602, "invalid chainId"))?;
                if !state.known_chains.contains(&chain) {
                    return Err(ProviderError::new(
                        UNRECOGNIZED_CHAIN,
                        format!("Unrecognized chain ID {}", quantity(u128::from(chain))),
                    ));
                }
                state.chain_id = chain;
                Ok(Value::Null)
            }
            "wallet_addEthereumChain" => {
                if state.fail_add {
                    return Err(ProviderError::new(USER_REJECTED, "User rejected the request."));
                }
                let chain = Self::requested_chain(&params)
                    .ok_or_else(|| ProviderError::new(-32602, "invalid chainId"))?;
                state.known_chains.insert(chain);
                state.chain_id = chain;
                Ok(Value::Null)
            }
            "eth_getCode" => {
                let address = params[0].as_str().and_then(|s| s.parse::<Address>().ok());
                match address {
                    Some(a) if state.deployed.contains(&a) => Ok(json!("0x6080604052")),
                    _ => Ok(json!("0x")),
                }
            }
            // Nothing submitted through the wallet is ever mined.
            "eth_getTransactionReceipt" => Ok(Value::Null),
            other => Err(ProviderError::new(-32601, format!("method {} not supported", other))),
        }
    }

    fn subscribe(&self) -> WalletSubscription {
        WalletSubscription::new(self.events.subscribe())
    }
}

#[derive(Default)]
struct RegistryState {
    properties: BTreeMap<u64, Property>,
    transactions: BTreeMap<u64, Transaction>,
    property_transactions: HashMap<u64, Vec<u64>>,
    roles: HashMap<Address, String>,
    failing_reads: HashSet<u64>,
    revert_next: Option<String>,
    read_delay: Option<Duration>,
    submitted: Vec<RegistryCall>,
    receipts: HashMap<String, Receipt>,
    reads: usize,
    block: u64,
    clock: u64,
}

/// In-memory registry; clones share state, each bound to its own signer.
#[derive(Clone)]
pub struct MockRegistry {
    state: Arc<Mutex<RegistryState>>,
    address: Address,
    signer: Address,
}

impl MockRegistry {
    pub fn new(address: Address) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                clock: 1_700_000_000,
                ..RegistryState::default()
            })),
            address,
            signer: Address::ZERO,
        }
    }

    pub fn bound_to(&self, signer: Address) -> Self {
        Self {
            signer,
            ..self.clone()
        }
    }

    /// Factory for [`crate::chain::ConnectionManager`] handing out handles on this state.
    pub fn factory(&self) -> ContractFactory {
        let registry = self.clone();
        Arc::new(move |_wallet, _address, signer| {
            Arc::new(registry.bound_to(signer)) as Arc<dyn RegistryContract>
        })
    }

    /// Inserts a property as-is; the id is taken from the record.
    pub fn insert_property(&self, property: Property) {
        lock(&self.state).properties.insert(property.id, property);
    }

    pub fn insert_transaction(&self, tx: Transaction) {
        let mut state = lock(&self.state);
        state
            .property_transactions
            .entry(tx.property_id)
            .or_default()
            .push(tx.id);
        state.transactions.insert(tx.id, tx);
    }

    pub fn set_role(&self, user: Address, role: &str) {
        lock(&self.state).roles.insert(user, role.to_string());
    }

    /// Reads of this property id revert.
    pub fn fail_reads_of(&self, id: u64) {
        lock(&self.state).failing_reads.insert(id);
    }

    /// The next submitted call reverts with `reason`.
    pub fn revert_next(&self, reason: &str) {
        lock(&self.state).revert_next = Some(reason.to_string());
    }

    /// Every read sleeps this long first.
    pub fn set_read_delay(&self, delay: Duration) {
        lock(&self.state).read_delay = Some(delay);
    }

    pub fn property(&self, id: u64) -> Option<Property> {
        lock(&self.state).properties.get(&id).cloned()
    }

    pub fn submitted(&self) -> Vec<RegistryCall> {
        lock(&self.state).submitted.clone()
    }

    pub fn reads(&self) -> usize {
        lock(&self.state).reads
    }

    async fn read_pause(&self) {
        let delay = {
            let mut state = lock(&self.state);
            state.reads += 1;
            state.read_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn apply(&self, state: &mut RegistryState, call: &RegistryCall) -> Result<Vec<LogEntry>> {
        let revert = |reason: &str| Err(DashboardError::ContractCallReverted(reason.to_string()));
        state.clock += 1;
        let now = state.clock;
        let signer = self.signer;
        let emitted = |event: RegistryEvent, id: u64| LogEntry {
            address: self.address,
            topics: vec![event.topic(), id_topic(id)],
            data: Vec::new(),
        };

        match call {
            RegistryCall::RegisterProperty(draft) => {
                let id = state.properties.keys().next_back().copied().unwrap_or(0) + 1;
                state.properties.insert(
                    id,
                    Property {
                        id,
                        state: draft.state.clone(),
                        district: draft.district.clone(),
                        village: draft.village.clone(),
                        survey_number: draft.survey_number.clone(),
                        owner: draft.owner,
                        market_value: draft.market_value,
                        reference_id: format!("PROP-{}", id),
                        document_hash: Some(draft.document_hash.clone()).filter(|h| !h.is_empty()),
                        status: PropertyStatus::Pending,
                        registered_at: now,
                        last_updated: now,
                        is_active: true,
                    },
                );
                Ok(vec![emitted(RegistryEvent::PropertyRegistered, id)])
            }
            RegistryCall::RegisterUser { user, name, .. } => {
                state.roles.insert(*user, name.clone());
                Ok(Vec::new())
            }
            RegistryCall::ApproveProperty { property_id, approve } => {
                let Some(p) = state.properties.get_mut(property_id) else {
                    return revert("Property does not exist");
                };
                if p.status != PropertyStatus::Pending {
                    return revert("Property is not pending approval");
                }
                p.status = if *approve {
                    PropertyStatus::Approved
                } else {
                    PropertyStatus::Rejected
                };
                p.last_updated = now;
                Ok(vec![emitted(RegistryEvent::PropertyStatusChanged, *property_id)])
            }
            RegistryCall::ListForSale { property_id, price } => {
                let Some(p) = state.properties.get_mut(property_id) else {
                    return revert("Property does not exist");
                };
                if p.owner != signer {
                    return revert("Only the owner can list the property");
                }
                if p.status != PropertyStatus::Approved {
                    return revert("Property must be approved");
                }
                p.status = PropertyStatus::ListedForSale;
                p.market_value = *price;
                p.last_updated = now;
                Ok(vec![emitted(RegistryEvent::PropertyListedForSale, *property_id)])
            }
            RegistryCall::RequestToPurchase {
                property_id,
                offer,
                document_hash,
            } => {
                let Some(p) = state.properties.get_mut(property_id) else {
                    return revert("Property does not exist");
                };
                if p.status != PropertyStatus::ListedForSale {
                    return revert("Property is not for sale");
                }
                if p.owner == signer {
                    return revert("Owner cannot purchase own property");
                }
                if *offer < p.market_value {
                    return revert("Offer below market value");
                }
                p.status = PropertyStatus::PurchasePending;
                p.last_updated = now;
                let seller = p.owner;
                let tx_id = state.transactions.len() as u64 + 1;
                state.transactions.insert(
                    tx_id,
                    Transaction {
                        id: tx_id,
                        property_id: *property_id,
                        seller,
                        buyer: signer,
                        price: *offer,
                        status: TransactionStatus::Pending,
                        requested_at: now,
                        completed_at: 0,
                        document_hash: Some(document_hash.clone()).filter(|h| !h.is_empty()),
                    },
                );
                state
                    .property_transactions
                    .entry(*property_id)
                    .or_default()
                    .push(tx_id);
                Ok(vec![emitted(RegistryEvent::PurchaseRequested, *property_id)])
            }
            RegistryCall::ProcessPurchaseRequest {
                transaction_id,
                approve,
            } => {
                let Some(tx) = state.transactions.get_mut(transaction_id) else {
                    return revert("Transaction does not exist");
                };
                if tx.status != TransactionStatus::Pending {
                    return revert("Transaction already processed");
                }
                tx.status = if *approve {
                    TransactionStatus::Approved
                } else {
                    TransactionStatus::Rejected
                };
                let property_id = tx.property_id;
                if !approve {
                    if let Some(p) = state.properties.get_mut(&property_id) {
                        p.status = PropertyStatus::ListedForSale;
                        p.last_updated = now;
                    }
                    return Ok(vec![emitted(RegistryEvent::PurchaseRejected, property_id)]);
                }
                Ok(vec![emitted(RegistryEvent::PurchaseApproved, property_id)])
            }
            RegistryCall::CompletePurchase { transaction_id } => {
                let Some(tx) = state.transactions.get_mut(transaction_id) else {
                    return revert("Transaction does not exist");
                };
                if tx.status != TransactionStatus::Approved {
                    return revert("Transaction not approved");
                }
                tx.completed_at = now;
                let (property_id, buyer) = (tx.property_id, tx.buyer);
                if let Some(p) = state.properties.get_mut(&property_id) {
                    p.owner = buyer;
                    p.status = PropertyStatus::Sold;
                    p.last_updated = now;
                }
                Ok(vec![emitted(RegistryEvent::OwnershipTransferred, property_id)])
            }
            RegistryCall::UpdateDocuments {
                property_id,
                document_hash,
            } => {
                let Some(p) = state.properties.get_mut(property_id) else {
                    return revert("Property does not exist");
                };
                if p.owner != signer {
                    return revert("Only the owner can update documents");
                }
                p.document_hash = Some(document_hash.clone()).filter(|h| !h.is_empty());
                p.last_updated = now;
                Ok(vec![emitted(RegistryEvent::DocumentsUpdated, *property_id)])
            }
            RegistryCall::RemoveFromSale { property_id } => {
                let Some(p) = state.properties.get_mut(property_id) else {
                    return revert("Property does not exist");
                };
                if p.owner != signer {
                    return revert("Only the owner can remove the listing");
                }
                if !matches!(
                    p.status,
                    PropertyStatus::ListedForSale | PropertyStatus::PurchasePending
                ) {
                    return revert("Property is not listed");
                }
                p.status = PropertyStatus::Approved;
                p.last_updated = now;
                Ok(vec![emitted(RegistryEvent::PropertyStatusChanged, *property_id)])
            }
        }
    }
}

fn id_topic(id: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&id.to_be_bytes());
    word
}

#[async_trait]
impl RegistryContract for MockRegistry {
    fn address(&self) -> Address {
        self.address
    }

    fn signer(&self) -> Address {
        self.signer
    }

    async fn get_property(&self, id: u64) -> Result<Property> {
        self.read_pause().await;
        let state = lock(&self.state);
        if state.failing_reads.contains(&id) {
            return Err(DashboardError::ContractCallReverted("read failed".into()));
        }
        // An unset mapping slot reads back zeroed.
        Ok(state.properties.get(&id).cloned().unwrap_or_else(|| Property {
            id: 0,
            state: String::new(),
            district: String::new(),
            village: String::new(),
            survey_number: String::new(),
            owner: Address::ZERO,
            market_value: 0,
            reference_id: String::new(),
            document_hash: None,
            status: PropertyStatus::Pending,
            registered_at: 0,
            last_updated: 0,
            is_active: false,
        }))
    }

    async fn get_transaction(&self, id: u64) -> Result<Transaction> {
        self.read_pause().await;
        lock(&self.state)
            .transactions
            .get(&id)
            .cloned()
            .ok_or_else(|| DashboardError::ContractCallReverted("Transaction does not exist".into()))
    }

    async fn get_owner_properties(&self, owner: Address) -> Result<Vec<u64>> {
        self.read_pause().await;
        Ok(lock(&self.state)
            .properties
            .values()
            .filter(|p| p.owner == owner)
            .map(|p| p.id)
            .collect())
    }

    async fn get_property_transactions(&self, property_id: u64) -> Result<Vec<u64>> {
        self.read_pause().await;
        Ok(lock(&self.state)
            .property_transactions
            .get(&property_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_total_properties(&self) -> Result<u64> {
        self.read_pause().await;
        Ok(lock(&self.state).properties.keys().next_back().copied().unwrap_or(0))
    }

    async fn is_registered_user(&self, user: Address) -> Result<bool> {
        Ok(lock(&self.state).roles.contains_key(&user))
    }

    async fn user_role(&self, user: Address) -> Result<String> {
        self.read_pause().await;
        Ok(lock(&self.state).roles.get(&user).cloned().unwrap_or_default())
    }

    async fn paused(&self) -> Result<bool> {
        Ok(false)
    }

    async fn role_id(&self, role: Role) -> Result<[u8; 32]> {
        Ok(keccak256(format!("{:?}", role).as_bytes()))
    }

    async fn submit(&self, call: RegistryCall) -> Result<PendingTx> {
        let mut state = lock(&self.state);
        state.submitted.push(call.clone());
        if let Some(reason) = state.revert_next.take() {
            return Err(DashboardError::ContractCallReverted(reason));
        }
        let logs = self.apply(&mut state, &call)?;
        state.block += 1;
        let hash = format!("0x{:064x}", state.block);
        let receipt = Receipt {
            tx_hash: hash.clone(),
            block_number: state.block,
            logs,
        };
        state.receipts.insert(hash.clone(), receipt);
        Ok(PendingTx {
            hash,
            call: call.name(),
        })
    }

    async fn wait(&self, pending: &PendingTx) -> Result<Receipt> {
        lock(&self.state)
            .receipts
            .get(&pending.hash)
            .cloned()
            .ok_or_else(|| DashboardError::NotFound(format!("receipt {}", pending.hash)))
    }
}

/// Gateway that hashes content locally and records every upload.
#[derive(Default)]
pub struct MockGateway {
    uploads: Mutex<Vec<String>>,
    fail: bool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn uploads(&self) -> Vec<String> {
        lock(&self.uploads).clone()
    }
}

#[async_trait]
impl StorageGateway for MockGateway {
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String> {
        if self.fail {
            return Err(DashboardError::Upload("gateway unavailable".into()));
        }
        lock(&self.uploads).push(file_name.to_string());
        Ok(format!("Qm{}", hex::encode(&keccak256(&bytes)[..16])))
    }

    fn url_for(&self, hash: &str) -> String {
        join_url("https://gateway.test/ipfs", hash)
    }
}
