//! Shared application state handed to every handler

use std::sync::Arc;

use playmeter_cache::Counters;
use playmeter_services::Engine;

pub struct AppState {
    pub engine: Arc<Engine>,
    /// Secret the settlement gateway presents on callbacks
    pub webhook_secret: String,
    /// `postgres` or `memory`
    pub storage_backend: &'static str,
    pub counters: Arc<Counters>,
}

impl AppState {
    pub fn new(
        engine: Arc<Engine>,
        webhook_secret: impl Into<String>,
        storage_backend: &'static str,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            engine,
            webhook_secret: webhook_secret.into(),
            storage_backend,
            counters,
        }
    }
}
