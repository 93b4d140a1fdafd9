//! Buyer dashboard: what the caller can buy and what they own.

use std::sync::Arc;

use serde::Serialize;

use super::list::{available_for_purchase, fetch_properties};
use super::{cards, fetch_each, PropertyCard, ViewHandle};
use crate::contract::RegistryContract;
use crate::error::Result;
use crate::models::{Address, Property};
use crate::session::Session;

/// Available properties shown on the dashboard.
pub const FEATURED_COUNT: usize = 6;

#[derive(Debug, Clone, Serialize)]
pub struct BuyerDashboard {
    pub account: Address,
    pub role: Option<String>,
    pub available_count: usize,
    pub featured: Vec<PropertyCard>,
    pub owned: Vec<PropertyCard>,
    pub failed_ids: Vec<u64>,
}

/// Properties recorded against `owner`, read one by one.
pub async fn fetch_owned(
    contract: &dyn RegistryContract,
    owner: Address,
) -> Result<(Vec<Property>, Vec<u64>)> {
    let ids = contract.get_owner_properties(owner).await?;
    let (records, failed) = fetch_each(&ids, "owned property", |id| contract.get_property(id)).await;
    Ok((records.into_iter().filter(|p| p.id != 0).collect(), failed))
}

pub struct DashboardView {
    session: Arc<Session>,
    handle: ViewHandle,
}

impl DashboardView {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            handle: ViewHandle::new(),
        }
    }

    pub fn handle(&self) -> &ViewHandle {
        &self.handle
    }

    /// `None` when the result was dropped as stale.
    pub async fn load(&self) -> Result<Option<BuyerDashboard>> {
        let snapshot = self.session.snapshot().await;
        let (account, contract) = snapshot.require()?;
        let fetched = futures::try_join!(
            fetch_properties(contract.as_ref()),
            fetch_owned(contract.as_ref(), account)
        );

        if !self.handle.accepts(snapshot.epoch, self.session.epoch().await) {
            log::debug!("Dropping stale dashboard of {}", account);
            return Ok(None);
        }
        let ((all, mut failed_ids), (owned, failed_owned)) = fetched?;
        failed_ids.extend(failed_owned);
        failed_ids.sort_unstable();
        failed_ids.dedup();

        let available = available_for_purchase(&all, &account);
        Ok(Some(BuyerDashboard {
            account,
            role: snapshot.role.clone(),
            available_count: available.len(),
            featured: cards(&available[..available.len().min(FEATURED_COUNT)]),
            owned: cards(&owned),
            failed_ids,
        }))
    }
}
