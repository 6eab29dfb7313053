use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::publisher::StagingPublisher;
use crate::relay::RelayHealth;
use courier_config::Config;

/// Application context shared by the HTTP handlers
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    /// Transactional publisher for the staging topics
    pub publisher: Arc<dyn StagingPublisher>,
    /// Relay workers behind the publisher
    relays: RelayHealth,
    /// Set once startup finished, cleared on shutdown
    ready: Arc<AtomicBool>,
}

impl AppContext {
    /// Creates a new application context
    pub fn new(
        config: Arc<Config>,
        publisher: Arc<dyn StagingPublisher>,
        relays: RelayHealth,
    ) -> Self {
        Self {
            config,
            publisher,
            relays,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Started, not shutting down, and every relay still running
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.relays.is_healthy()
    }

    pub fn relays_healthy(&self) -> bool {
        self.relays.is_healthy()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}
