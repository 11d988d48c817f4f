//! Application state management

use sauti_core::Relay;
use std::sync::Arc;

use crate::events::WsEventRouter;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub routes: Arc<WsEventRouter>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, routes: Arc<WsEventRouter>) -> Self {
        Self { relay, routes }
    }
}
