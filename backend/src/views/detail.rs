//! Single property with its purchase requests and owner/buyer actions.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use super::{fetch_each, InFlight, PropertyCard, ViewHandle};
use crate::contract::{execute, Receipt, RegistryCall, RegistryContract};
use crate::error::{DashboardError, Result};
use crate::gateway::{upload_document, DocumentFile, StorageGateway};
use crate::models::{Address, Property, PropertyStatus, Transaction};
use crate::session::Session;
use crate::units::{format_units, parse_units};

/// Which mutating actions the caller may trigger on a property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionAvailability {
    pub can_list: bool,
    pub can_purchase: bool,
    pub can_remove: bool,
}

pub fn actions_for(property: &Property, account: Option<&Address>) -> ActionAvailability {
    let Some(account) = account else {
        return ActionAvailability::default();
    };
    let is_owner = property.is_owned_by(account);
    ActionAvailability {
        can_list: is_owner && property.status == PropertyStatus::Approved,
        can_purchase: !is_owner && property.status == PropertyStatus::ListedForSale,
        can_remove: is_owner
            && matches!(
                property.status,
                PropertyStatus::ListedForSale | PropertyStatus::PurchasePending
            ),
    }
}

/// Reads one property; an unset slot (id 0) is reported as not found.
pub async fn fetch_property(contract: &dyn RegistryContract, id: u64) -> Result<Property> {
    let property = contract.get_property(id).await?;
    if property.id == 0 {
        return Err(DashboardError::NotFound(format!("Property {}", id)));
    }
    Ok(property)
}

/// Reads the transaction id list of a property, then each transaction.
pub async fn fetch_transactions(
    contract: &dyn RegistryContract,
    property_id: u64,
) -> Result<(Vec<Transaction>, Vec<u64>)> {
    let ids = contract.get_property_transactions(property_id).await?;
    Ok(fetch_each(&ids, "transaction", |id| contract.get_transaction(id)).await)
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertyDetail {
    #[serde(flatten)]
    pub card: PropertyCard,
    pub transactions: Vec<Transaction>,
    pub failed_transaction_ids: Vec<u64>,
    pub actions: ActionAvailability,
    pub document_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub tx_hash: String,
    pub block_number: u64,
    pub property: Option<PropertyDetail>,
}

struct Loaded {
    property: Property,
    transactions: Vec<Transaction>,
    failed_ids: Vec<u64>,
    // Session epoch the record was read in.
    epoch: u64,
}

pub struct PropertyDetailView {
    session: Arc<Session>,
    gateway: Arc<dyn StorageGateway>,
    property_id: u64,
    handle: ViewHandle,
    state: RwLock<Option<Loaded>>,
    listing: AtomicBool,
    requesting: AtomicBool,
    removing: AtomicBool,
}

impl PropertyDetailView {
    pub fn new(session: Arc<Session>, gateway: Arc<dyn StorageGateway>, property_id: u64) -> Self {
        Self {
            session,
            gateway,
            property_id,
            handle: ViewHandle::new(),
            state: RwLock::new(None),
            listing: AtomicBool::new(false),
            requesting: AtomicBool::new(false),
            removing: AtomicBool::new(false),
        }
    }

    pub fn property_id(&self) -> u64 {
        self.property_id
    }

    pub fn handle(&self) -> &ViewHandle {
        &self.handle
    }

    /// Loads the property, then its transactions. `None` when the result
    /// was dropped as stale.
    pub async fn load(&self) -> Result<Option<PropertyDetail>> {
        let snapshot = self.session.snapshot().await;
        let (account, contract) = snapshot.require()?;
        let fetched = async {
            let property = fetch_property(contract.as_ref(), self.property_id).await?;
            let (transactions, failed_ids) =
                fetch_transactions(contract.as_ref(), self.property_id).await?;
            Ok::<_, DashboardError>(Loaded {
                property,
                transactions,
                failed_ids,
                epoch: snapshot.epoch,
            })
        }
        .await;

        if !self.handle.accepts(snapshot.epoch, self.session.epoch().await) {
            log::debug!("Dropping stale detail of property {}", self.property_id);
            return Ok(None);
        }
        *self.state.write().await = Some(fetched?);
        Ok(self.detail_for(&account).await)
    }

    /// Last loaded state rendered for `account`.
    pub async fn detail_for(&self, account: &Address) -> Option<PropertyDetail> {
        let state = self.state.read().await;
        let loaded = state.as_ref()?;
        Some(PropertyDetail {
            card: PropertyCard::from(&loaded.property),
            transactions: loaded.transactions.clone(),
            failed_transaction_ids: loaded.failed_ids.clone(),
            actions: actions_for(&loaded.property, Some(account)),
            document_url: self.document_url(&loaded.property),
        })
    }

    pub fn document_url(&self, property: &Property) -> Option<String> {
        property
            .document_hash
            .as_deref()
            .map(|hash| self.gateway.url_for(hash))
    }

    /// Property the action gate is evaluated against: the displayed record
    /// if it was read in the current session epoch, otherwise a fresh read.
    async fn current(&self) -> Result<(Address, Arc<dyn RegistryContract>, u64, Property)> {
        let snapshot = self.session.snapshot().await;
        let (account, contract) = snapshot.require()?;
        let cached = {
            let mut state = self.state.write().await;
            match state.as_ref() {
                Some(loaded) if loaded.epoch == snapshot.epoch => Some(loaded.property.clone()),
                Some(_) => {
                    log::debug!("Discarding property {} read in an older session", self.property_id);
                    *state = None;
                    None
                }
                None => None,
            }
        };
        let property = match cached {
            Some(property) => property,
            None => fetch_property(contract.as_ref(), self.property_id).await?,
        };
        Ok((account, contract, snapshot.epoch, property))
    }

    /// Lists an approved property owned by the caller at `price_text`.
    pub async fn list_for_sale(&self, price_text: &str) -> Result<ActionOutcome> {
        let _in_flight = InFlight::begin(&self.listing, "Listing")?;
        let (account, contract, epoch, property) = self.current().await?;
        if !actions_for(&property, Some(&account)).can_list {
            return Err(DashboardError::ActionNotPermitted("Listing"));
        }
        let price = parse_units(price_text)?;
        if price == 0 {
            return Err(DashboardError::InvalidAmount(
                "Price must be greater than zero".into(),
            ));
        }

        let receipt = execute(
            contract.as_ref(),
            RegistryCall::ListForSale {
                property_id: self.property_id,
                price,
            },
        )
        .await?;
        self.refresh(contract.as_ref(), epoch, false).await;
        Ok(self.outcome(receipt, &account).await)
    }

    /// Requests to buy a listed property, escrowing `offer_text`. An
    /// attached document is uploaded first and referenced by the request.
    pub async fn request_purchase(
        &self,
        offer_text: &str,
        document: Option<DocumentFile>,
    ) -> Result<ActionOutcome> {
        let _in_flight = InFlight::begin(&self.requesting, "Purchase request")?;
        let (account, contract, epoch, property) = self.current().await?;
        if !actions_for(&property, Some(&account)).can_purchase {
            return Err(DashboardError::ActionNotPermitted("Purchase request"));
        }
        let offer = parse_units(offer_text)?;
        if offer == 0 {
            return Err(DashboardError::InvalidAmount(
                "Offer must be greater than zero".into(),
            ));
        }
        if offer < property.market_value {
            return Err(DashboardError::InvalidAmount(format!(
                "Price must be at least equal to market value ({})",
                format_units(property.market_value)
            )));
        }

        let document_hash = match document {
            Some(file) => upload_document(self.gateway.as_ref(), file).await?,
            None => String::new(),
        };
        let receipt = execute(
            contract.as_ref(),
            RegistryCall::RequestToPurchase {
                property_id: self.property_id,
                offer,
                document_hash,
            },
        )
        .await?;
        self.refresh(contract.as_ref(), epoch, true).await;
        Ok(self.outcome(receipt, &account).await)
    }

    /// Takes a listed or purchase-pending property off the market.
    pub async fn remove_from_sale(&self) -> Result<ActionOutcome> {
        let _in_flight = InFlight::begin(&self.removing, "Removal from sale")?;
        let (account, contract, epoch, property) = self.current().await?;
        if !actions_for(&property, Some(&account)).can_remove {
            return Err(DashboardError::ActionNotPermitted("Removal from sale"));
        }
        let receipt = execute(
            contract.as_ref(),
            RegistryCall::RemoveFromSale {
                property_id: self.property_id,
            },
        )
        .await?;
        self.refresh(contract.as_ref(), epoch, false).await;
        Ok(self.outcome(receipt, &account).await)
    }

    /// Re-reads after a confirmed call. The call already succeeded, so a
    /// failed re-read only leaves the old record in place.
    async fn refresh(&self, contract: &dyn RegistryContract, epoch: u64, with_transactions: bool) {
        let property = match fetch_property(contract, self.property_id).await {
            Ok(property) => property,
            Err(e) => {
                log::warn!("Could not refresh property {}: {}", self.property_id, e);
                return;
            }
        };
        let transactions = if with_transactions {
            match fetch_transactions(contract, self.property_id).await {
                Ok(fetched) => Some(fetched),
                Err(e) => {
                    log::warn!("Could not refresh transactions of {}: {}", self.property_id, e);
                    None
                }
            }
        } else {
            None
        };

        if !self.handle.accepts(epoch, self.session.epoch().await) {
            log::debug!("Dropping stale refresh of property {}", self.property_id);
            return;
        }
        let mut state = self.state.write().await;
        match state.as_mut() {
            Some(loaded) => {
                loaded.property = property;
                loaded.epoch = epoch;
                if let Some((txs, failed)) = transactions {
                    loaded.transactions = txs;
                    loaded.failed_ids = failed;
                }
            }
            None => {
                let (transactions, failed_ids) = transactions.unwrap_or_default();
                *state = Some(Loaded {
                    property,
                    transactions,
                    failed_ids,
                    epoch,
                });
            }
        }
    }

    async fn outcome(&self, receipt: Receipt, account: &Address) -> ActionOutcome {
        ActionOutcome {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            property: self.detail_for(account).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property(owner: Address, status: PropertyStatus) -> Property {
        Property {
            id: 9,
            state: "Tamil Nadu".into(),
            district: "Madurai".into(),
            village: "Melur".into(),
            survey_number: "44/2B".into(),
            owner,
            market_value: 5,
            reference_id: String::new(),
            document_hash: None,
            status,
            registered_at: 0,
            last_updated: 0,
            is_active: true,
        }
    }

    fn addr(n: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[0] = n;
        Address::from_bytes(bytes)
    }

    #[test]
    fn owner_may_list_only_approved_properties() {
        let owner = addr(1);
        assert!(actions_for(&property(owner, PropertyStatus::Approved), Some(&owner)).can_list);
        assert!(!actions_for(&property(owner, PropertyStatus::Pending), Some(&owner)).can_list);
        assert!(!actions_for(&property(owner, PropertyStatus::Approved), Some(&addr(2))).can_list);
    }

    #[test]
    fn only_non_owners_may_request_purchase() {
        let owner = addr(1);
        let listed = property(owner, PropertyStatus::ListedForSale);
        assert!(actions_for(&listed, Some(&addr(2))).can_purchase);
        assert!(!actions_for(&listed, Some(&owner)).can_purchase);
        assert!(actions_for(&listed, Some(&owner)).can_remove);
        assert!(actions_for(&property(owner, PropertyStatus::PurchasePending), Some(&owner)).can_remove);
        assert!(!actions_for(&property(owner, PropertyStatus::Sold), Some(&owner)).can_remove);
    }

    #[test]
    fn nothing_is_available_without_an_account() {
        let listed = property(addr(1), PropertyStatus::ListedForSale);
        assert_eq!(actions_for(&listed, None), ActionAvailability::default());
    }
}
