use axum::{routing::get, Router};
use coalesce_core::config::CoalesceConfig;
use coalesce_debounce::{DebounceSetup, Debouncer, Dispatcher, DutyTracker};
use coalesce_store::SharedStore;
use std::sync::Arc;

use crate::filter::SenderFilter;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CoalesceConfig,
    pub debouncer: Arc<dyn Debouncer>,
    /// Shared store behind the lease debouncer, when one is in use.
    pub store: Option<Arc<dyn SharedStore>>,
    /// Leader duties running past the request that elected them.
    pub duties: DutyTracker,
    pub dispatcher: Dispatcher,
    pub filter: SenderFilter,
}

impl AppState {
    pub fn new(config: CoalesceConfig, setup: DebounceSetup, dispatcher: Dispatcher) -> Self {
        let filter = SenderFilter::from_config(&config.filter);
        Self {
            config,
            debouncer: setup.debouncer,
            store: setup.store,
            duties: DutyTracker::new(),
            dispatcher,
            filter,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/webhook",
            get(crate::http::webhook::verify_handler).post(crate::http::webhook::webhook_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
