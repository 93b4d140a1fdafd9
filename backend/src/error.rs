//! Error taxonomy for the dashboard.
//!
//! Every wallet, contract and gateway failure is converted into one
//! [`DashboardError`] at the call site. The HTTP layer turns it into a
//! single notification body; nothing is retried automatically.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::wallet::ProviderError;

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("No wallet provider detected. Install a browser wallet to connect.")]
    NoWallet,

    #[error("The wallet request was rejected: {0}")]
    UserRejected(String),

    #[error("No accounts found. Unlock the wallet and try again.")]
    NoAccounts,

    #[error("Wrong network: expected chain {expected}, wallet is on chain {actual}")]
    NetworkMismatch { expected: u64, actual: u64 },

    #[error("Failed to switch network: {0}")]
    NetworkSwitch(String),

    #[error("No contract found at address {0}. Deploy the contract first.")]
    ContractNotDeployed(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Document upload failed: {0}")]
    Upload(String),

    #[error("{0}")]
    ContractCallReverted(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidFile(String),

    #[error("Wallet is not connected")]
    NotConnected,

    #[error("{0} not found")]
    NotFound(String),

    #[error("The wallet session changed while loading. Reload to see current data.")]
    SessionChanged,

    #[error("{0} is already in progress")]
    ActionInProgress(&'static str),

    #[error("{0} is not available for this property")]
    ActionNotPermitted(&'static str),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Failed to decode contract data: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl DashboardError {
    /// The single notification shown to the user for this failure.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DashboardError::NoWallet
            | DashboardError::NotConnected
            | DashboardError::NoAccounts => StatusCode::UNAUTHORIZED,
            DashboardError::UserRejected(_) | DashboardError::ActionNotPermitted(_) => {
                StatusCode::FORBIDDEN
            }
            DashboardError::InvalidAmount(_)
            | DashboardError::Validation(_)
            | DashboardError::InvalidFile(_) => StatusCode::BAD_REQUEST,
            DashboardError::NotFound(_) => StatusCode::NOT_FOUND,
            DashboardError::ActionInProgress(_) | DashboardError::SessionChanged => {
                StatusCode::CONFLICT
            }
            DashboardError::ContractCallReverted(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DashboardError::NetworkMismatch { .. }
            | DashboardError::NetworkSwitch(_)
            | DashboardError::ContractNotDeployed(_)
            | DashboardError::Upload(_)
            | DashboardError::Provider(_)
            | DashboardError::Decode(_) => StatusCode::BAD_GATEWAY,
            DashboardError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        } else {
            log::warn!("Request rejected: {}", self);
        }
        (status, Json(json!({ "error": self.user_message() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DashboardError>;
