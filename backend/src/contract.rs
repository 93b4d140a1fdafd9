//! The land-registry contract handle.
//!
//! The registry's rules (approval, escrow, ownership transfer) live in the
//! deployed contract. This module only knows its method and event surface:
//! [`RegistryContract`] is the signer-bound handle the views talk to, and
//! [`RpcRegistry`] implements it through a [`WalletProvider`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::abi::{
    call_data, decode_one, decode_revert_reason, from_hex, keccak256, parse_quantity, quantity,
    to_hex, AbiError, ParamType, Token,
};
use crate::error::{DashboardError, Result};
use crate::models::{Address, Property, PropertyDraft, Transaction};
use crate::wallet::{ProviderError, WalletProvider, INTERNAL_ERROR};

/// Every state-changing method of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    RegisterProperty(PropertyDraft),
    RegisterUser {
        user: Address,
        role: [u8; 32],
        name: String,
    },
    ApproveProperty {
        property_id: u64,
        approve: bool,
    },
    ListForSale {
        property_id: u64,
        price: u128,
    },
    RequestToPurchase {
        property_id: u64,
        offer: u128,
        document_hash: String,
    },
    ProcessPurchaseRequest {
        transaction_id: u64,
        approve: bool,
    },
    CompletePurchase {
        transaction_id: u64,
    },
    UpdateDocuments {
        property_id: u64,
        document_hash: String,
    },
    RemoveFromSale {
        property_id: u64,
    },
}

impl RegistryCall {
    pub fn signature(&self) -> &'static str {
        match self {
            RegistryCall::RegisterProperty(_) => {
                "registerProperty(string,string,string,string,address,uint256,string)"
            }
            RegistryCall::RegisterUser { .. } => "registerUser(address,bytes32,string)",
            RegistryCall::ApproveProperty { .. } => "approveProperty(uint256,bool)",
            RegistryCall::ListForSale { .. } => "listPropertyForSale(uint256,uint256)",
            RegistryCall::RequestToPurchase { .. } => "requestToPurchase(uint256,uint256,string)",
            RegistryCall::ProcessPurchaseRequest { .. } => "processPurchaseRequest(uint256,bool)",
            RegistryCall::CompletePurchase { .. } => "completePurchase(uint256)",
            RegistryCall::UpdateDocuments { .. } => "updatePropertyDocuments(uint256,string)",
            RegistryCall::RemoveFromSale { .. } => "removeFromSale(uint256)",
        }
    }

    pub fn name(&self) -> &'static str {
        let sig = self.signature();
        sig.split('(').next().unwrap_or(sig)
    }

    pub fn args(&self) -> Vec<Token> {
        match self {
            RegistryCall::RegisterProperty(draft) => vec![
                Token::String(draft.state.clone()),
                Token::String(draft.district.clone()),
                Token::String(draft.village.clone()),
                Token::String(draft.survey_number.clone()),
                Token::Address(draft.owner),
                Token::Uint(draft.market_value),
                Token::String(draft.document_hash.clone()),
            ],
            RegistryCall::RegisterUser { user, role, name } => vec![
                Token::Address(*user),
                Token::Bytes32(*role),
                Token::String(name.clone()),
            ],
            RegistryCall::ApproveProperty {
                property_id,
                approve,
            } => vec![Token::Uint(u128::from(*property_id)), Token::Bool(*approve)],
            RegistryCall::ListForSale { property_id, price } => {
                vec![Token::Uint(u128::from(*property_id)), Token::Uint(*price)]
            }
            RegistryCall::RequestToPurchase {
                property_id,
                offer,
                document_hash,
            } => vec![
                Token::Uint(u128::from(*property_id)),
                Token::Uint(*offer),
                Token::String(document_hash.clone()),
            ],
            RegistryCall::ProcessPurchaseRequest {
                transaction_id,
                approve,
            } => vec![Token::Uint(u128::from(*transaction_id)), Token::Bool(*approve)],
            RegistryCall::CompletePurchase { transaction_id } => {
                vec![Token::Uint(u128::from(*transaction_id))]
            }
            RegistryCall::UpdateDocuments {
                property_id,
                document_hash,
            } => vec![
                Token::Uint(u128::from(*property_id)),
                Token::String(document_hash.clone()),
            ],
            RegistryCall::RemoveFromSale { property_id } => {
                vec![Token::Uint(u128::from(*property_id))]
            }
        }
    }

    /// Native currency attached to the call; only purchase requests escrow funds.
    pub fn value(&self) -> u128 {
        match self {
            RegistryCall::RequestToPurchase { offer, .. } => *offer,
            _ => 0,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        call_data(self.signature(), &self.args())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    SuperAdmin,
    Government,
    PropertyOwner,
    LegalProfessional,
}

impl Role {
    fn getter(self) -> &'static str {
        match self {
            Role::SuperAdmin => "SUPERADMIN_ROLE()",
            Role::Government => "GOVERNMENT_ROLE()",
            Role::PropertyOwner => "PROPERTY_OWNER_ROLE()",
            Role::LegalProfessional => "LEGAL_PROFESSIONAL_ROLE()",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    PropertyRegistered,
    PropertyStatusChanged,
    PropertyListedForSale,
    PurchaseRequested,
    PurchaseApproved,
    PurchaseRejected,
    OwnershipTransferred,
    UserRegistered,
    DocumentsUpdated,
}

impl RegistryEvent {
    pub const ALL: [RegistryEvent; 9] = [
        RegistryEvent::PropertyRegistered,
        RegistryEvent::PropertyStatusChanged,
        RegistryEvent::PropertyListedForSale,
        RegistryEvent::PurchaseRequested,
        RegistryEvent::PurchaseApproved,
        RegistryEvent::PurchaseRejected,
        RegistryEvent::OwnershipTransferred,
        RegistryEvent::UserRegistered,
        RegistryEvent::DocumentsUpdated,
    ];

    pub fn signature(self) -> &'static str {
        match self {
            RegistryEvent::PropertyRegistered => "PropertyRegistered(uint256,address,string,uint256)",
            RegistryEvent::PropertyStatusChanged => "PropertyStatusChanged(uint256,uint8,uint8)",
            RegistryEvent::PropertyListedForSale => "PropertyListedForSale(uint256,address,uint256)",
            RegistryEvent::PurchaseRequested => {
                "PurchaseRequested(uint256,uint256,address,address,uint256)"
            }
            RegistryEvent::PurchaseApproved => "PurchaseApproved(uint256,uint256,address)",
            RegistryEvent::PurchaseRejected => "PurchaseRejected(uint256,uint256,address)",
            RegistryEvent::OwnershipTransferred => {
                "OwnershipTransferred(uint256,address,address,uint256)"
            }
            RegistryEvent::UserRegistered => "UserRegistered(address,string)",
            RegistryEvent::DocumentsUpdated => "DocumentsUpdated(uint256,string)",
        }
    }

    pub fn topic(self) -> [u8; 32] {
        keccak256(self.signature().as_bytes())
    }

    pub fn from_topic(topic: &[u8; 32]) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.topic() == *topic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTx {
    pub hash: String,
    pub call: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: u64,
    pub logs: Vec<LogEntry>,
}

impl Receipt {
    pub fn events(&self) -> Vec<RegistryEvent> {
        self.logs
            .iter()
            .filter_map(|log| log.topics.first().and_then(RegistryEvent::from_topic))
            .collect()
    }

    /// Id carried by a `PropertyRegistered` event, if the receipt has one.
    pub fn registered_property_id(&self) -> Option<u64> {
        let topic = RegistryEvent::PropertyRegistered.topic();
        let log = self.logs.iter().find(|log| log.topics.first() == Some(&topic))?;
        let id_word = log.topics.get(1)?;
        decode_one(ParamType::Uint, id_word)
            .and_then(Token::into_u64)
            .ok()
    }
}

/// Signer-bound handle to the deployed registry.
#[async_trait]
pub trait RegistryContract: Send + Sync {
    fn address(&self) -> Address;

    /// Account that signs mutating calls.
    fn signer(&self) -> Address;

    async fn get_property(&self, id: u64) -> Result<Property>;

    async fn get_transaction(&self, id: u64) -> Result<Transaction>;

    async fn get_owner_properties(&self, owner: Address) -> Result<Vec<u64>>;

    async fn get_property_transactions(&self, property_id: u64) -> Result<Vec<u64>>;

    async fn get_total_properties(&self) -> Result<u64>;

    async fn is_registered_user(&self, user: Address) -> Result<bool>;

    async fn user_role(&self, user: Address) -> Result<String>;

    async fn paused(&self) -> Result<bool>;

    async fn role_id(&self, role: Role) -> Result<[u8; 32]>;

    async fn submit(&self, call: RegistryCall) -> Result<PendingTx>;

    /// Resolves once the transaction is mined; a failed transaction is an error.
    async fn wait(&self, pending: &PendingTx) -> Result<Receipt>;
}

/// Submits `call` and waits for its confirmation.
pub async fn execute(contract: &dyn RegistryContract, call: RegistryCall) -> Result<Receipt> {
    let pending = contract.submit(call).await?;
    log::info!("Submitted {} as {}", pending.call, pending.hash);
    let receipt = contract.wait(&pending).await?;
    log::info!(
        "{} confirmed in block {} with events {:?}",
        pending.call,
        receipt.block_number,
        receipt.events()
    );
    Ok(receipt)
}

/// Reason string of a reverted call, taken from the error data when it
/// carries an `Error(string)` payload, otherwise from the message.
pub fn revert_reason(err: &ProviderError) -> Option<String> {
    let data_hex = err.data.as_ref().and_then(|data| {
        data.as_str()
            .or_else(|| data.get("data").and_then(Value::as_str))
            .map(str::to_string)
    });
    if let Some(reason) = data_hex
        .and_then(|hex| from_hex(&hex).ok())
        .and_then(|bytes| decode_revert_reason(&bytes))
    {
        return Some(reason);
    }

    let message = err.message.as_str();
    if let Some((_, rest)) = message.split_once("reverted with reason string '") {
        return Some(rest.trim_end_matches('\'').to_string());
    }
    if let Some(rest) = message.strip_prefix("execution reverted: ") {
        return Some(rest.to_string());
    }
    if message.contains("revert") {
        return Some(message.to_string());
    }
    None
}

fn call_error(err: ProviderError) -> DashboardError {
    if err.is_user_rejection() {
        return DashboardError::UserRejected(err.message);
    }
    match revert_reason(&err) {
        Some(reason) => DashboardError::ContractCallReverted(reason),
        None => DashboardError::Provider(err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RawLog>,
}

#[derive(Deserialize)]
struct RawLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

impl RawReceipt {
    fn into_receipt(self) -> Result<(Receipt, bool)> {
        let success = match self.status.as_deref() {
            Some(status) => parse_quantity(status)? == 1,
            None => true,
        };
        let block_number = match self.block_number.as_deref() {
            Some(n) => u64::try_from(parse_quantity(n)?).map_err(|_| AbiError::Overflow)?,
            None => 0,
        };
        let logs = self
            .logs
            .into_iter()
            .map(|raw| -> Result<LogEntry> {
                let topics = raw
                    .topics
                    .iter()
                    .map(|t| {
                        let bytes = from_hex(t)?;
                        <[u8; 32]>::try_from(bytes.as_slice())
                            .map_err(|_| AbiError::InvalidHex(format!("topic {}", t)))
                    })
                    .collect::<std::result::Result<Vec<_>, AbiError>>()?;
                Ok(LogEntry {
                    address: raw.address.parse()?,
                    topics,
                    data: from_hex(&raw.data)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((
            Receipt {
                tx_hash: self.transaction_hash,
                block_number,
                logs,
            },
            success,
        ))
    }
}

/// Two minutes at the default poll interval.
pub const DEFAULT_RECEIPT_POLLS: u32 = 240;

/// [`RegistryContract`] over a wallet's JSON-RPC transport.
pub struct RpcRegistry {
    wallet: Arc<dyn WalletProvider>,
    address: Address,
    signer: Address,
    receipt_poll: Duration,
    receipt_polls: u32,
}

impl RpcRegistry {
    pub fn new(wallet: Arc<dyn WalletProvider>, address: Address, signer: Address) -> Self {
        Self {
            wallet,
            address,
            signer,
            receipt_poll: Duration::from_millis(500),
            receipt_polls: DEFAULT_RECEIPT_POLLS,
        }
    }

    pub fn with_receipt_poll(mut self, interval: Duration) -> Self {
        self.receipt_poll = interval;
        self
    }

    /// Receipt lookups made before a transaction is given up on.
    pub fn with_receipt_polls(mut self, polls: u32) -> Self {
        self.receipt_polls = polls.max(1);
        self
    }

    async fn call(&self, signature: &str, args: &[Token], returns: ParamType) -> Result<Token> {
        let data = call_data(signature, args);
        let request = json!({
            "from": self.signer.to_string(),
            "to": self.address.to_string(),
            "data": to_hex(&data),
        });
        let result = self
            .wallet
            .request("eth_call", json!([request, "latest"]))
            .await
            .map_err(call_error)?;
        let hex = result
            .as_str()
            .ok_or_else(|| DashboardError::Decode(format!("{} returned {}", signature, result)))?;
        Ok(decode_one(returns, &from_hex(hex)?)?)
    }

    async fn call_ids(&self, signature: &str, arg: Token) -> Result<Vec<u64>> {
        self.call(signature, &[arg], ParamType::Array(Box::new(ParamType::Uint)))
            .await?
            .into_array()?
            .into_iter()
            .map(|id| id.into_u64().map_err(DashboardError::from))
            .collect()
    }
}

#[async_trait]
impl RegistryContract for RpcRegistry {
    fn address(&self) -> Address {
        self.address
    }

    fn signer(&self) -> Address {
        self.signer
    }

    async fn get_property(&self, id: u64) -> Result<Property> {
        let token = self
            .call("getProperty(uint256)", &[Token::Uint(u128::from(id))], Property::schema())
            .await?;
        Ok(Property::from_token(token)?)
    }

    async fn get_transaction(&self, id: u64) -> Result<Transaction> {
        let token = self
            .call(
                "getTransaction(uint256)",
                &[Token::Uint(u128::from(id))],
                Transaction::schema(),
            )
            .await?;
        Ok(Transaction::from_token(token)?)
    }

    async fn get_owner_properties(&self, owner: Address) -> Result<Vec<u64>> {
        self.call_ids("getOwnerProperties(address)", Token::Address(owner))
            .await
    }

    async fn get_property_transactions(&self, property_id: u64) -> Result<Vec<u64>> {
        self.call_ids(
            "getPropertyTransactions(uint256)",
            Token::Uint(u128::from(property_id)),
        )
        .await
    }

    async fn get_total_properties(&self) -> Result<u64> {
        Ok(self
            .call("getTotalProperties()", &[], ParamType::Uint)
            .await?
            .into_u64()?)
    }

    async fn is_registered_user(&self, user: Address) -> Result<bool> {
        Ok(self
            .call("registeredUsers(address)", &[Token::Address(user)], ParamType::Bool)
            .await?
            .into_bool()?)
    }

    async fn user_role(&self, user: Address) -> Result<String> {
        Ok(self
            .call("userRoles(address)", &[Token::Address(user)], ParamType::String)
            .await?
            .into_string()?)
    }

    async fn paused(&self) -> Result<bool> {
        Ok(self
            .call("paused()", &[], ParamType::Bool)
            .await?
            .into_bool()?)
    }

    async fn role_id(&self, role: Role) -> Result<[u8; 32]> {
        Ok(self
            .call(role.getter(), &[], ParamType::Bytes32)
            .await?
            .into_bytes32()?)
    }

    async fn submit(&self, call: RegistryCall) -> Result<PendingTx> {
        let tx = json!({
            "from": self.signer.to_string(),
            "to": self.address.to_string(),
            "data": to_hex(&call.data()),
            "value": quantity(call.value()),
        });
        // Gas estimation simulates the call, so reverts surface here with their reason.
        self.wallet
            .request("eth_estimateGas", json!([tx.clone()]))
            .await
            .map_err(call_error)?;
        let hash = self
            .wallet
            .request("eth_sendTransaction", json!([tx]))
            .await
            .map_err(call_error)?;
        let hash = hash
            .as_str()
            .ok_or_else(|| DashboardError::Decode(format!("transaction hash {}", hash)))?;
        Ok(PendingTx {
            hash: hash.to_string(),
            call: call.name(),
        })
    }

    async fn wait(&self, pending: &PendingTx) -> Result<Receipt> {
        for attempt in 1..=self.receipt_polls {
            let raw = self
                .wallet
                .request("eth_getTransactionReceipt", json!([pending.hash]))
                .await?;
            if !raw.is_null() {
                let raw: RawReceipt = serde_json::from_value(raw)
                    .map_err(|e| DashboardError::Decode(format!("receipt: {}", e)))?;
                let (receipt, success) = raw.into_receipt()?;
                if !success {
                    return Err(DashboardError::ContractCallReverted(format!(
                        "{} reverted in block {}",
                        pending.call, receipt.block_number
                    )));
                }
                return Ok(receipt);
            }
            if attempt < self.receipt_polls {
                tokio::time::sleep(self.receipt_poll).await;
            }
        }
        log::warn!(
            "No receipt for {} after {} polls, giving up",
            pending.hash,
            self.receipt_polls
        );
        Err(DashboardError::Provider(ProviderError::new(
            INTERNAL_ERROR,
            format!(
                "{} transaction {} was not mined after {} polls",
                pending.call, pending.hash, self.receipt_polls
            ),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{decode, selector};

    #[test]
    fn purchase_requests_attach_the_offer_as_value() {
        let call = RegistryCall::RequestToPurchase {
            property_id: 4,
            offer: 5_000,
            document_hash: String::new(),
        };
        assert_eq!(call.value(), 5_000);
        assert_eq!(call.name(), "requestToPurchase");
        assert_eq!(RegistryCall::RemoveFromSale { property_id: 4 }.value(), 0);
    }

    #[test]
    fn encodes_registration_arguments() {
        let owner: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let call = RegistryCall::RegisterProperty(PropertyDraft {
            state: "Kerala".into(),
            district: "Kollam".into(),
            village: "Chavara".into(),
            survey_number: "12/4".into(),
            owner,
            market_value: 10,
            document_hash: "QmHash".into(),
        });
        let data = call.data();
        assert_eq!(&data[..4], &selector(call.signature()));
        let tokens = decode(
            &[
                ParamType::String,
                ParamType::String,
                ParamType::String,
                ParamType::String,
                ParamType::Address,
                ParamType::Uint,
                ParamType::String,
            ],
            &data[4..],
        )
        .unwrap();
        assert_eq!(tokens, call.args());
    }

    #[test]
    fn extracts_revert_reasons_from_provider_errors() {
        let payload = call_data("Error(string)", &[Token::String("Not listed".into())]);
        let mut err = ProviderError::new(3, "execution reverted");
        err.data = Some(Value::String(to_hex(&payload)));
        assert_eq!(revert_reason(&err).as_deref(), Some("Not listed"));

        let err = ProviderError::new(
            -32603,
            "Error: VM Exception while processing transaction: reverted with reason string 'Insufficient payment'",
        );
        assert_eq!(revert_reason(&err).as_deref(), Some("Insufficient payment"));

        let err = ProviderError::new(-32000, "nonce too low");
        assert_eq!(revert_reason(&err), None);
        assert!(matches!(call_error(err), DashboardError::Provider(_)));
    }

    #[test]
    fn user_rejection_is_not_a_revert() {
        let err = ProviderError::new(4001, "User denied transaction signature");
        assert!(matches!(call_error(err), DashboardError::UserRejected(_)));
    }

    #[test]
    fn reads_registered_property_id_from_receipt() {
        let mut id_topic = [0u8; 32];
        id_topic[31] = 12;
        let receipt = Receipt {
            tx_hash: "0x01".into(),
            block_number: 3,
            logs: vec![LogEntry {
                address: Address::ZERO,
                topics: vec![RegistryEvent::PropertyRegistered.topic(), id_topic],
                data: Vec::new(),
            }],
        };
        assert_eq!(receipt.registered_property_id(), Some(12));
        assert_eq!(receipt.events(), vec![RegistryEvent::PropertyRegistered]);
    }

    #[test]
    fn parses_raw_receipts() {
        let raw: RawReceipt = serde_json::from_value(json!({
            "transactionHash": "0xabc",
            "blockNumber": "0x10",
            "status": "0x0",
            "logs": []
        }))
        .unwrap();
        let (receipt, success) = raw.into_receipt().unwrap();
        assert!(!success);
        assert_eq!(receipt.block_number, 16);
    }

    #[tokio::test]
    async fn wait_gives_up_on_a_transaction_that_never_mines() {
        let wallet = Arc::new(crate::mock::MockWallet::new(Vec::new(), 31337));
        let registry = RpcRegistry::new(wallet.clone(), Address::ZERO, Address::ZERO)
            .with_receipt_poll(Duration::from_millis(1))
            .with_receipt_polls(3);
        let pending = PendingTx {
            hash: "0xdead".into(),
            call: "removeFromSale",
        };

        let err = registry.wait(&pending).await.unwrap_err();
        assert!(matches!(err, DashboardError::Provider(_)));
        assert_eq!(wallet.count_calls("eth_getTransactionReceipt"), 3);
    }
}
