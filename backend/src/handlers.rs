//! HTTP routes over the session and views.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::{DashboardError, Result};
use crate::gateway::{DocumentFile, StorageGateway};
use crate::models::PropertyStatus;
use crate::session::{Session, SessionInfo};
use crate::views::dashboard::{BuyerDashboard, DashboardView};
use crate::views::detail::{ActionOutcome, PropertyDetail, PropertyDetailView};
use crate::views::list::{ListPage, PropertyListView};
use crate::views::register::{RegisterPropertyView, RegistrationForm, RegistrationOutcome};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub session: Arc<Session>,
    pub gateway: Arc<dyn StorageGateway>,
    register: Arc<RegisterPropertyView>,
    details: Arc<Mutex<DetailCache>>,
}

/// One detail view per existing property, so in-flight actions are shared
/// across requests. Emptied whenever the session epoch moves.
#[derive(Default)]
struct DetailCache {
    epoch: u64,
    views: HashMap<u64, Arc<PropertyDetailView>>,
}

impl DetailCache {
    fn sync(&mut self, epoch: u64) {
        if self.epoch == epoch {
            return;
        }
        for view in self.views.values() {
            view.handle().unmount();
        }
        if !self.views.is_empty() {
            log::debug!("Session moved on, dropping {} detail views", self.views.len());
        }
        self.views.clear();
        self.epoch = epoch;
    }
}

impl AppState {
    pub fn new(config: AppConfig, session: Arc<Session>, gateway: Arc<dyn StorageGateway>) -> Self {
        Self {
            config: Arc::new(config),
            register: Arc::new(RegisterPropertyView::new(
                Arc::clone(&session),
                Arc::clone(&gateway),
            )),
            session,
            gateway,
            details: Arc::new(Mutex::new(DetailCache::default())),
        }
    }

    fn new_detail_view(&self, id: u64) -> Arc<PropertyDetailView> {
        Arc::new(PropertyDetailView::new(
            Arc::clone(&self.session),
            Arc::clone(&self.gateway),
            id,
        ))
    }

    /// Loads a property's detail. The view is kept only once the property
    /// was found in the current session.
    async fn load_detail(&self, id: u64) -> Result<PropertyDetail> {
        let epoch = self.session.epoch().await;
        let cached = {
            let mut details = self.details.lock().await;
            details.sync(epoch);
            details.views.get(&id).cloned()
        };
        let view = cached.unwrap_or_else(|| self.new_detail_view(id));
        let detail = view.load().await?.ok_or(DashboardError::SessionChanged)?;

        let mut details = self.details.lock().await;
        details.sync(self.session.epoch().await);
        if details.epoch == epoch {
            details.views.entry(id).or_insert(view);
        }
        Ok(detail)
    }

    /// Runs a mutating action on the shared view of property `id`.
    async fn detail_action<T, F, Fut>(&self, id: u64, action: F) -> Result<T>
    where
        F: FnOnce(Arc<PropertyDetailView>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let snapshot = self.session.snapshot().await;
        snapshot.require()?;
        let view = {
            let mut details = self.details.lock().await;
            details.sync(snapshot.epoch);
            Arc::clone(
                details
                    .views
                    .entry(id)
                    .or_insert_with(|| self.new_detail_view(id)),
            )
        };
        let result = action(Arc::clone(&view)).await;
        if let Err(DashboardError::NotFound(_)) = &result {
            let mut details = self.details.lock().await;
            if details.views.get(&id).is_some_and(|cached| Arc::ptr_eq(cached, &view)) {
                details.views.remove(&id);
            }
        }
        result
    }

    #[cfg(test)]
    async fn cached_details(&self) -> usize {
        self.details.lock().await.views.len()
    }
}

/// A document attached to a JSON request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpload {
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub content_base64: String,
}

impl DocumentUpload {
    fn into_file(self) -> Result<DocumentFile> {
        let bytes = STANDARD
            .decode(self.content_base64.trim())
            .map_err(|_| DashboardError::InvalidFile("Document content is not valid base64".into()))?;
        Ok(DocumentFile {
            file_name: self.file_name,
            content_type: self.content_type,
            bytes,
        })
    }
}

fn into_file(document: Option<DocumentUpload>) -> Result<Option<DocumentFile>> {
    document.map(DocumentUpload::into_file).transpose()
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(flatten)]
    pub form: RegistrationForm,
    #[serde(default)]
    pub document: Option<DocumentUpload>,
}

#[derive(Debug, Deserialize)]
pub struct ListForSaleRequest {
    pub price: String,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub offer: String,
    #[serde(default)]
    pub document: Option<DocumentUpload>,
}

async fn index(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": "Land Registry Dashboard",
        "chainId": state.config.chain_id,
        "chainName": state.config.chain_name,
        "contract": state.config.contract_address,
    }))
}

async fn session_info(State(state): State<AppState>) -> Json<SessionInfo> {
    Json(state.session.snapshot().await.info())
}

async fn connect(State(state): State<AppState>) -> Result<Json<SessionInfo>> {
    let snapshot = state.session.connect().await?;
    Ok(Json(snapshot.info()))
}

async fn disconnect(State(state): State<AppState>) -> Json<SessionInfo> {
    Json(state.session.disconnect().await.info())
}

async fn list_properties(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListPage>> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(text) => Some(text.parse::<PropertyStatus>()?),
    };
    let view = PropertyListView::new(Arc::clone(&state.session));
    view.set_search(&query.search).await;
    view.set_status_filter(status).await;
    Ok(Json(view.render().await?))
}

async fn property_detail(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<PropertyDetail>> {
    Ok(Json(state.load_detail(id).await?))
}

async fn register_property(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegistrationOutcome>> {
    let document = into_file(request.document)?;
    let outcome = state.register.submit(&request.form, document).await?;
    Ok(Json(outcome))
}

async fn list_for_sale(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<ListForSaleRequest>,
) -> Result<Json<ActionOutcome>> {
    let outcome = state
        .detail_action(id, |view| async move { view.list_for_sale(&request.price).await })
        .await?;
    Ok(Json(outcome))
}

async fn request_purchase(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<PurchaseRequest>,
) -> Result<Json<ActionOutcome>> {
    let document = into_file(request.document)?;
    let outcome = state
        .detail_action(id, |view| async move {
            view.request_purchase(&request.offer, document).await
        })
        .await?;
    Ok(Json(outcome))
}

async fn remove_from_sale(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ActionOutcome>> {
    let outcome = state
        .detail_action(id, |view| async move { view.remove_from_sale().await })
        .await?;
    Ok(Json(outcome))
}

async fn dashboard(State(state): State<AppState>) -> Result<Json<BuyerDashboard>> {
    let dashboard = DashboardView::new(Arc::clone(&state.session))
        .load()
        .await?
        .ok_or(DashboardError::SessionChanged)?;
    Ok(Json(dashboard))
}

async fn document_url(State(state): State<AppState>, Path(hash): Path<String>) -> Json<Value> {
    Json(json!({ "hash": hash, "url": state.gateway.url_for(&hash) }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/session", get(session_info))
        .route("/session/connect", post(connect))
        .route("/session/disconnect", post(disconnect))
        .route("/properties", get(list_properties).post(register_property))
        .route("/properties/:id", get(property_detail))
        .route("/properties/:id/list", post(list_for_sale))
        .route("/properties/:id/purchase", post(request_purchase))
        .route("/properties/:id/remove-from-sale", post(remove_from_sale))
        .route("/dashboard", get(dashboard))
        .route("/documents/:hash", get(document_url))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ConnectionManager, NetworkDescriptor};
    use crate::mock::{test_address, MockGateway, MockRegistry, MockWallet};
    use crate::models::{Address, Property};
    use crate::units::parse_units;
    use crate::wallet::{WalletEvent, WalletProvider};

    const CHAIN: u64 = 31337;

    fn config() -> AppConfig {
        AppConfig {
            contract_address: test_address(0xcc).to_string(),
            chain_id: CHAIN,
            chain_name: "Local Hardhat Network".into(),
            rpc_url: "http://127.0.0.1:8545".into(),
            currency_name: "Ether".into(),
            currency_symbol: "ETH".into(),
            gateway_api_url: "http://127.0.0.1:5001/api/v0".into(),
            gateway_url: "https://ipfs.io/ipfs/".into(),
            port: 3000,
            wallet_poll_ms: 1000,
            receipt_poll_ms: 500,
            receipt_max_polls: 240,
        }
    }

    fn listed(id: u64, owner: Address, value: &str) -> Property {
        Property {
            id,
            state: "Maharashtra".into(),
            district: "Pune".into(),
            village: "Hinjawadi".into(),
            survey_number: format!("{}/1", id),
            owner,
            market_value: parse_units(value).unwrap(),
            reference_id: String::new(),
            document_hash: None,
            status: PropertyStatus::ListedForSale,
            registered_at: 1_700_000_000,
            last_updated: 1_700_000_000,
            is_active: true,
        }
    }

    async fn app(account: Address) -> (AppState, Arc<MockWallet>, MockRegistry) {
        let config = config();
        let wallet = Arc::new(
            MockWallet::new(vec![account], CHAIN).with_deployed_contract(test_address(0xcc)),
        );
        let registry = MockRegistry::new(test_address(0xcc));
        let manager = ConnectionManager::new(
            Some(Arc::clone(&wallet) as Arc<dyn WalletProvider>),
            NetworkDescriptor::from_config(&config),
            &config.contract_address,
        )
        .with_contract_factory(registry.factory());
        let session = Arc::new(Session::new(manager));
        session.connect().await.unwrap();
        let state = AppState::new(config, session, Arc::new(MockGateway::new()));
        (state, wallet, registry)
    }

    #[tokio::test]
    async fn unknown_properties_are_not_cached() {
        let (state, _, _) = app(test_address(2)).await;

        let err = state.load_detail(404).await.unwrap_err();
        assert!(matches!(err, DashboardError::NotFound(_)));
        let err = state
            .detail_action(405, |view| async move { view.remove_from_sale().await })
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::NotFound(_)));
        assert_eq!(state.cached_details().await, 0);
    }

    #[tokio::test]
    async fn actions_require_a_connection_before_caching() {
        let (state, _, _) = app(test_address(2)).await;
        state.session.disconnect().await;

        let err = state
            .detail_action(7, |view| async move { view.remove_from_sale().await })
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::NotConnected));
        assert_eq!(state.cached_details().await, 0);
    }

    #[tokio::test]
    async fn network_change_drops_cached_views() {
        let (state, wallet, registry) = app(test_address(2)).await;
        registry.insert_property(listed(7, test_address(1), "10"));
        state.load_detail(7).await.unwrap();
        assert_eq!(state.cached_details().await, 1);
        let old = state.details.lock().await.views.get(&7).cloned().unwrap();

        wallet.change_chain(1);
        state
            .session
            .handle_event(WalletEvent::ChainChanged(1))
            .await
            .unwrap();
        registry.insert_property(listed(7, test_address(1), "20"));

        let err = state
            .detail_action(7, |view| async move { view.request_purchase("15", None).await })
            .await
            .unwrap_err();
        assert!(matches!(err, DashboardError::InvalidAmount(_)));
        assert!(registry.submitted().is_empty());
        assert!(!old.handle().is_mounted());
        let fresh = state.details.lock().await.views.get(&7).cloned().unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
    }
}
