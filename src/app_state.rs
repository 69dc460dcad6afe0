//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::cashout_service::CashoutService;
use crate::geo::GeoService;
use crate::submission_service::SubmissionService;
use crate::wallet_service::WalletService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub submission_service: Arc<SubmissionService>,
    pub cashout_service: Arc<CashoutService>,
    pub wallet_service: Arc<WalletService>,
    pub geo_service: Arc<GeoService>,
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(
        submission_service: Arc<SubmissionService>,
        cashout_service: Arc<CashoutService>,
        wallet_service: Arc<WalletService>,
        geo_service: Arc<GeoService>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            submission_service,
            cashout_service,
            wallet_service,
            geo_service,
            webhook_secret,
        }
    }
}

impl FromRef<AppState> for Arc<SubmissionService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.submission_service.clone()
    }
}

impl FromRef<AppState> for Arc<CashoutService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.cashout_service.clone()
    }
}

impl FromRef<AppState> for Arc<WalletService> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.wallet_service.clone()
    }
}
