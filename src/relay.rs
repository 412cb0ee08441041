//! Wiring of the relay components from configuration

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::error::Result;
use crate::events::{EventBus, InProcessBus};
use crate::merge::ContentMerger;
use crate::session::Coordinator;
use crate::storage::DocumentStore;
use crate::upstream::{HttpUpstream, Upstream};

/// A fully assembled relay
///
/// # Examples
///
/// ```no_run
/// use storyrelay::config::Config;
/// use storyrelay::relay::Relay;
///
/// # fn main() -> anyhow::Result<()> {
/// let relay = Relay::open(&Config::default())?;
/// assert_eq!(relay.coordinator.active_count(), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Relay {
    pub coordinator: Coordinator,
    pub bus: Arc<dyn EventBus>,
    pub store: DocumentStore,
    pub merger: ContentMerger,
    pub audit: AuditLog,
}

impl Relay {
    /// Assemble a relay talking to the configured HTTP provider
    pub fn open(config: &Config) -> Result<Self> {
        let upstream = Arc::new(HttpUpstream::from_config(config)?);
        Self::with_upstream(config, upstream)
    }

    /// Assemble a relay around any upstream
    pub fn with_upstream(config: &Config, upstream: Arc<dyn Upstream>) -> Result<Self> {
        let store = DocumentStore::from_config(&config.storage)?;
        let audit = AuditLog::from_config(&config.storage)?;
        let bus: Arc<dyn EventBus> = Arc::new(InProcessBus::new(config.relay.channel_capacity));
        let merger = ContentMerger::new(store.clone(), bus.clone(), config.relay.merge_max_retries);
        let coordinator = Coordinator::new(
            upstream,
            bus.clone(),
            merger.clone(),
            config.provider.clone(),
            &config.relay,
            Some(audit.clone()),
        );

        tracing::debug!(
            endpoint = %config.provider.endpoint,
            timeout_seconds = config.relay.timeout_seconds,
            "Relay assembled"
        );

        Ok(Self {
            coordinator,
            bus,
            store,
            merger,
            audit,
        })
    }
}
