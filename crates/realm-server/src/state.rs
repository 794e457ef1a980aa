//! Shared application state for HTTP handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use realm_hub::{MessagingHub, SyncState};
use tokio::sync::watch;

/// State shared by every request handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The process's messaging hub.
    pub hub: Arc<MessagingHub>,
    /// Lifecycle of the broker synchronization.
    pub sync: watch::Receiver<SyncState>,
    /// When the server came up.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// State for a running server.
    pub fn new(hub: Arc<MessagingHub>, sync: watch::Receiver<SyncState>) -> Self {
        Self {
            hub,
            sync,
            started_at: Utc::now(),
        }
    }
}
