//! Shared handler state.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use jotter_core::NotificationHub;

use crate::auth::TokenSigner;
use crate::services::RequestLifecycle;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<RequestLifecycle>,
    pub hub: Arc<NotificationHub>,
    pub signer: Arc<TokenSigner>,
    /// Open WebSocket connections.
    pub ws_connections: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(lifecycle: Arc<RequestLifecycle>, signer: Arc<TokenSigner>) -> Self {
        Self {
            hub: lifecycle.hub().clone(),
            lifecycle,
            signer,
            ws_connections: Arc::new(AtomicUsize::new(0)),
        }
    }
}
