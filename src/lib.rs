//! Huddle server - real-time collaboration for bounty issues

pub mod config;
pub mod error;
pub mod guard;
pub mod models;
pub mod moderation;
pub mod policy;
pub mod protocol;
pub mod room;
pub mod routes;
pub mod session;
pub mod snippet;
pub mod store;
pub mod websocket;

use axum::{routing::get, Router};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::session::Hub;
use crate::store::Store;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    pub hub: Arc<Hub>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: &Config) -> Arc<Self> {
        let store = Store::new(pool);
        let hub = Arc::new(Hub::new(config, Arc::new(store.clone())));
        Arc::new(Self { store, hub })
    }

    /// State with a hub built elsewhere, e.g. with a custom policy
    pub fn with_hub(pool: SqlitePool, hub: Hub) -> Arc<Self> {
        Arc::new(Self {
            store: Store::new(pool),
            hub: Arc::new(hub),
        })
    }
}

/// Routes without middleware; `main` adds tracing and CORS
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/ws", get(websocket::handler))
        .route("/rooms/:room_id/messages", get(routes::room_messages))
        .with_state(state)
}
