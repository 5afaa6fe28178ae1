use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use relay_agent::Relay;
use relay_core::config::RelayConfig;
use relay_slack::{EventRouter, ThreadRoots};

/// How long an event ID is remembered for duplicate suppression.
const EVENT_MEMORY: Duration = Duration::from_secs(600);
const EVENT_MEMORY_MAX: usize = 4096;

/// Central shared state, passed as `Arc<AppState>` to all handlers.
pub struct AppState {
    pub config: RelayConfig,
    pub relay: Arc<Relay>,
    pub router: EventRouter<Arc<dyn ThreadRoots>>,
    /// Event IDs already dispatched: event_id -> first seen.
    seen_events: DashMap<String, Instant>,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        relay: Arc<Relay>,
        router: EventRouter<Arc<dyn ThreadRoots>>,
    ) -> Self {
        Self {
            config,
            relay,
            router,
            seen_events: DashMap::new(),
        }
    }

    /// Record `event_id`; false when it was already seen recently.
    pub fn first_delivery(&self, event_id: &str) -> bool {
        if self.seen_events.len() >= EVENT_MEMORY_MAX {
            self.seen_events
                .retain(|_, seen| seen.elapsed() < EVENT_MEMORY);
        }
        match self.seen_events.entry(event_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/slack/events",
            post(crate::http::slack_events::slack_events_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
