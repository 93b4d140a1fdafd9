//! Property list with client-side search and status filter.
//!
//! Every property is read on each load and filtered locally. There is no
//! paging: the cost grows linearly with the registry.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use super::{cards, fetch_each, PropertyCard, ViewHandle};
use crate::contract::RegistryContract;
use crate::error::{DashboardError, Result};
use crate::models::{Address, Property, PropertyStatus};
use crate::session::Session;

/// Reads properties `1..=total` and keeps the active ones.
///
/// Returns the properties and the ids whose read failed. A failed count read
/// fails the whole load.
pub async fn fetch_properties(contract: &dyn RegistryContract) -> Result<(Vec<Property>, Vec<u64>)> {
    let total = contract.get_total_properties().await?;
    let ids: Vec<u64> = (1..=total).collect();
    let (records, failed) = fetch_each(&ids, "property", |id| contract.get_property(id)).await;
    let active = records
        .into_iter()
        .filter(|p| p.id != 0 && p.is_active)
        .collect();
    Ok((active, failed))
}

/// Case-insensitive substring search over id, survey number and location,
/// combined with an exact status match.
pub fn filter_properties(
    properties: &[Property],
    search: &str,
    status: Option<PropertyStatus>,
) -> Vec<Property> {
    let needle = search.trim().to_lowercase();
    properties
        .iter()
        .filter(|p| status.map_or(true, |s| p.status == s))
        .filter(|p| {
            needle.is_empty()
                || p.id.to_string().contains(&needle)
                || [&p.survey_number, &p.state, &p.district, &p.village]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&needle))
        })
        .cloned()
        .collect()
}

pub fn available_for_purchase(properties: &[Property], account: &Address) -> Vec<Property> {
    properties
        .iter()
        .filter(|p| p.is_available_for(account))
        .cloned()
        .collect()
}

#[derive(Default)]
struct ListState {
    properties: Vec<Property>,
    failed_ids: Vec<u64>,
    search: String,
    status: Option<PropertyStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListPage {
    pub total_active: usize,
    pub properties: Vec<PropertyCard>,
    pub search: String,
    pub status: Option<PropertyStatus>,
    pub failed_ids: Vec<u64>,
}

pub struct PropertyListView {
    session: Arc<Session>,
    handle: ViewHandle,
    state: RwLock<ListState>,
}

impl PropertyListView {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            handle: ViewHandle::new(),
            state: RwLock::new(ListState::default()),
        }
    }

    pub fn handle(&self) -> &ViewHandle {
        &self.handle
    }

    /// Reloads from the contract. Returns `false` when the result arrived
    /// for an unmounted view or a replaced session and was dropped.
    pub async fn load(&self) -> Result<bool> {
        let snapshot = self.session.snapshot().await;
        let (_, contract) = snapshot.require()?;
        let fetched = fetch_properties(contract.as_ref()).await;

        if !self.handle.accepts(snapshot.epoch, self.session.epoch().await) {
            log::debug!("Dropping stale property list");
            return Ok(false);
        }
        let (properties, failed_ids) = fetched?;
        log::info!(
            "Loaded {} active properties ({} unreadable)",
            properties.len(),
            failed_ids.len()
        );
        let mut state = self.state.write().await;
        state.properties = properties;
        state.failed_ids = failed_ids;
        Ok(true)
    }

    pub async fn set_search(&self, text: &str) {
        self.state.write().await.search = text.to_string();
    }

    pub async fn set_status_filter(&self, status: Option<PropertyStatus>) {
        self.state.write().await.status = status;
    }

    pub async fn all_active(&self) -> Vec<Property> {
        self.state.read().await.properties.clone()
    }

    /// Properties passing the current search and status filter.
    pub async fn visible(&self) -> Vec<Property> {
        let state = self.state.read().await;
        filter_properties(&state.properties, &state.search, state.status)
    }

    pub async fn available_for(&self, account: &Address) -> Vec<Property> {
        available_for_purchase(&self.state.read().await.properties, account)
    }

    pub async fn page(&self) -> ListPage {
        let state = self.state.read().await;
        let visible = filter_properties(&state.properties, &state.search, state.status);
        ListPage {
            total_active: state.properties.len(),
            properties: cards(&visible),
            search: state.search.clone(),
            status: state.status,
            failed_ids: state.failed_ids.clone(),
        }
    }

    /// Loads and renders in one step, failing if the load was dropped.
    pub async fn render(&self) -> Result<ListPage> {
        if !self.load().await? {
            return Err(DashboardError::SessionChanged);
        }
        Ok(self.page().await)
    }
}
