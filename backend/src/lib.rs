pub mod abi;
pub mod chain;
pub mod config;
pub mod contract;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod mock;
pub mod models;
pub mod session;
pub mod units;
pub mod views;
pub mod wallet;

pub use error::{DashboardError, Result};
