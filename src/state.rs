//! Application state shared across HTTP/WS handlers.
//!
//! Grounded on `backend/src/state.rs`'s `AppState` — one `Arc`-wrapped field
//! per subsystem, constructed once in `main.rs` and threaded through axum's
//! `State` extractor rather than accessed via a process-wide singleton.

use std::sync::Arc;

use crate::broadcast::Broadcaster;
use crate::metrics::MetricsEngine;
use crate::perf::PerformanceTracker;
use crate::session::SessionManager;
use crate::store::ObservationStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObservationStore>,
    pub broadcaster: Broadcaster,
    pub metrics: Arc<MetricsEngine>,
    pub perf: Arc<PerformanceTracker>,
    pub sessions: SessionManager,
}
