//! Lifecycle Controller
//!
//! The explicit owner of the single tunnel session. Start requests are
//! validated here before they reach the engine adapter; the adapter
//! serializes them against each other and against `stop`.

use crate::config::Config;
use crate::error::Result;
use crate::protocol::{self, OutboundConfig};
use crate::tunnel::{AdapterTimeouts, Engine, ProcessEngine, StatusSnapshot, TunnelAdapter, TunnelState};
use log::info;
use std::collections::HashSet;
use std::sync::Arc;

/// Controls the one tunnel session of a host application
pub struct LifecycleController {
    config: Config,
    adapter: TunnelAdapter,
}

impl LifecycleController {
    /// Create a controller driving `engine` with the timeouts from `config`
    pub fn new(config: Config, engine: Arc<dyn Engine>) -> Self {
        let timeouts = AdapterTimeouts::from(&config.engine);
        Self {
            adapter: TunnelAdapter::new(engine, timeouts),
            config,
        }
    }

    /// Create a controller running the configured engine binary
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid
    pub fn with_process_engine(config: Config) -> Result<Self> {
        config.validate()?;
        let engine = ProcessEngine::new(&config.engine, &config.logging.level);
        Ok(Self::new(config, Arc::new(engine)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate `outbound` and start a tunnel with it
    ///
    /// # Errors
    /// `Validation` for a rejected config (the session is left untouched),
    /// otherwise whatever the adapter reports
    pub async fn start(&self, outbound: OutboundConfig) -> Result<()> {
        // A session's engine document only carries the built-in outbounds
        // next to the active one; those tags are reserved by the validator.
        protocol::validate(&outbound, &HashSet::new())?;

        info!("Start requested: {outbound}");
        self.adapter.start(outbound).await
    }

    /// Parse an outbound object or an engine document, then start it
    pub async fn start_json(&self, config_json: &str) -> Result<()> {
        let outbound = OutboundConfig::from_json(config_json)?;
        self.start(outbound).await
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stop requested");
        self.adapter.stop().await
    }

    /// Current session snapshot, carrying the full active config
    pub async fn status(&self) -> StatusSnapshot {
        self.adapter.status().await
    }

    /// Last published snapshot, without waiting on the session
    pub fn last_status(&self) -> Arc<StatusSnapshot> {
        self.adapter.last_snapshot()
    }

    pub async fn is_running(&self) -> bool {
        self.status().await.state == TunnelState::Running
    }
}
