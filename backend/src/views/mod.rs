//! Headless view models over the session's contract handle.
//!
//! Each view reads through the [`Session`](crate::session::Session) it was
//! created with and keeps its last successful load. Loads that finish after
//! the view was unmounted, or after the session moved to another account
//! or network, are discarded.

pub mod dashboard;
pub mod detail;
pub mod list;
pub mod register;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;

use crate::error::{DashboardError, Result};
use crate::models::Property;
use crate::units::format_address;

/// Mount flag shared by a view and the loads it started.
#[derive(Debug, Clone)]
pub struct ViewHandle {
    mounted: Arc<AtomicBool>,
}

impl ViewHandle {
    pub fn new() -> Self {
        Self {
            mounted: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::Release);
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Whether a completion of work started in `started_epoch` may be applied.
    pub fn accepts(&self, started_epoch: u64, current_epoch: u64) -> bool {
        self.is_mounted() && started_epoch == current_epoch
    }
}

impl Default for ViewHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads every id concurrently.
///
/// A failed read drops only that entry: it is logged and its id returned in
/// the second list.
pub async fn fetch_each<T, F, Fut>(ids: &[u64], what: &str, read: F) -> (Vec<T>, Vec<u64>)
where
    F: Fn(u64) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let results = join_all(ids.iter().map(|&id| read(id))).await;
    let mut records = Vec::with_capacity(ids.len());
    let mut failed = Vec::new();
    for (&id, result) in ids.iter().zip(results) {
        match result {
            Ok(record) => records.push(record),
            Err(e) => {
                log::warn!("Skipping {} {}: {}", what, id, e);
                failed.push(id);
            }
        }
    }
    (records, failed)
}

/// Marks an action as running until dropped.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub(crate) fn begin(flag: &'a AtomicBool, action: &'static str) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(DashboardError::ActionInProgress(action));
        }
        Ok(InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A property with its display fields.
#[derive(Debug, Clone, Serialize)]
pub struct PropertyCard {
    pub property: Property,
    pub status_label: &'static str,
    pub market_value_display: String,
    pub owner_short: String,
    pub registered_on: String,
}

impl From<&Property> for PropertyCard {
    fn from(property: &Property) -> Self {
        PropertyCard {
            property: property.clone(),
            status_label: property.status.label(),
            market_value_display: property.market_value_display(),
            owner_short: format_address(&property.owner.to_string()),
            registered_on: property.registered_on(),
        }
    }
}

pub fn cards(properties: &[Property]) -> Vec<PropertyCard> {
    properties.iter().map(PropertyCard::from).collect()
}
