//! Property registration form.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::InFlight;
use crate::contract::{execute, RegistryCall};
use crate::error::{DashboardError, Result};
use crate::gateway::{upload_document, validate_file, DocumentFile, StorageGateway};
use crate::models::{Address, PropertyDraft};
use crate::session::Session;
use crate::units::parse_units;

/// Raw form input as typed by the user.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistrationForm {
    pub state: String,
    pub district: String,
    pub village: String,
    pub survey_number: String,
    /// Blank means the caller.
    pub owner: String,
    pub market_value: String,
}

fn required(value: &str, label: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DashboardError::Validation(format!("{} is required", label)));
    }
    Ok(value.to_string())
}

impl RegistrationForm {
    /// Checks the form without touching the network. The returned draft has
    /// no document hash yet.
    pub fn validate(&self, caller: Address) -> Result<PropertyDraft> {
        let state = required(&self.state, "State")?;
        let district = required(&self.district, "District")?;
        let village = required(&self.village, "Village")?;
        let survey_number = required(&self.survey_number, "Survey number")?;
        let market_value = parse_units(&required(&self.market_value, "Market value")?)?;
        if market_value == 0 {
            return Err(DashboardError::InvalidAmount(
                "Market value must be greater than zero".into(),
            ));
        }
        let owner = match self.owner.trim() {
            "" => caller,
            text => text
                .parse()
                .map_err(|_| DashboardError::Validation(format!("Invalid owner address: {}", text)))?,
        };
        Ok(PropertyDraft {
            state,
            district,
            village,
            survey_number,
            owner,
            market_value,
            document_hash: String::new(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationOutcome {
    pub tx_hash: String,
    pub block_number: u64,
    /// Id assigned by the registry, when the receipt reports it.
    pub property_id: Option<u64>,
    pub document_hash: Option<String>,
    pub document_url: Option<String>,
}

pub struct RegisterPropertyView {
    session: Arc<Session>,
    gateway: Arc<dyn StorageGateway>,
    submitting: AtomicBool,
}

impl RegisterPropertyView {
    pub fn new(session: Arc<Session>, gateway: Arc<dyn StorageGateway>) -> Self {
        Self {
            session,
            gateway,
            submitting: AtomicBool::new(false),
        }
    }

    /// Validates, uploads the document if any, then registers.
    ///
    /// A failed upload aborts the registration; the property is never
    /// registered without the document the user attached.
    pub async fn submit(
        &self,
        form: &RegistrationForm,
        document: Option<DocumentFile>,
    ) -> Result<RegistrationOutcome> {
        let _in_flight = InFlight::begin(&self.submitting, "Registration")?;
        let (account, contract) = self.session.snapshot().await.require()?;
        let mut draft = form.validate(account)?;
        if let Some(file) = &document {
            validate_file(file)?;
        }

        let document_hash = match document {
            Some(file) => Some(upload_document(self.gateway.as_ref(), file).await?),
            None => None,
        };
        draft.document_hash = document_hash.clone().unwrap_or_default();

        let receipt = execute(contract.as_ref(), RegistryCall::RegisterProperty(draft)).await?;
        let property_id = receipt.registered_property_id();
        match property_id {
            Some(id) => log::info!("Registered property {}", id),
            None => log::warn!("Registration confirmed without a PropertyRegistered event"),
        }
        Ok(RegistrationOutcome {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            property_id,
            document_url: document_hash.as_deref().map(|h| self.gateway.url_for(h)),
            document_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> Address {
        "0x3c44cdddb6a900fa2b585dd299e03d12fa4293bc".parse().unwrap()
    }

    fn form() -> RegistrationForm {
        RegistrationForm {
            state: "Kerala".into(),
            district: "Kollam".into(),
            village: "Chavara".into(),
            survey_number: "12/4".into(),
            owner: String::new(),
            market_value: "2.5".into(),
        }
    }

    #[test]
    fn blank_owner_defaults_to_caller() {
        let draft = form().validate(caller()).unwrap();
        assert_eq!(draft.owner, caller());
        assert_eq!(draft.market_value, 2_500_000_000_000_000_000);
        assert!(draft.document_hash.is_empty());
    }

    #[test]
    fn every_location_field_is_required() {
        for field in ["state", "district", "village", "survey_number"] {
            let mut f = form();
            match field {
                "state" => f.state = "  ".into(),
                "district" => f.district.clear(),
                "village" => f.village.clear(),
                _ => f.survey_number.clear(),
            }
            let err = f.validate(caller()).unwrap_err();
            assert!(matches!(err, DashboardError::Validation(_)), "{}", field);
        }
    }

    #[test]
    fn market_value_must_be_positive_number() {
        let mut f = form();
        f.market_value = "0".into();
        assert!(matches!(f.validate(caller()), Err(DashboardError::InvalidAmount(_))));
        f.market_value = "abc".into();
        assert!(matches!(f.validate(caller()), Err(DashboardError::InvalidAmount(_))));
        f.market_value = String::new();
        assert!(matches!(f.validate(caller()), Err(DashboardError::Validation(_))));
    }

    #[test]
    fn explicit_owner_must_be_an_address() {
        let mut f = form();
        f.owner = "not-an-address".into();
        assert!(f.validate(caller()).is_err());
        f.owner = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".into();
        assert_ne!(f.validate(caller()).unwrap().owner, caller());
    }
}
