//! Host-driven API: `TwinCore` owns the channel registry and the transfer scheduler.
//! The host attaches channel sinks, brings channels up, queues transfers, and calls
//! `tick` from its control loop.

use std::sync::Arc;

use bytes::Bytes;

use crate::arbiter::{self, ArbiterError, Policy};
use crate::config::{Config, ConfigError};
use crate::registry::{ChannelKind, ChannelSink, ChannelStatus, Registry, StatusObserver};
use crate::scheduler::{Scheduler, SchedulerError, TickReport, TransferJob};
use crate::transport::{Clock, SystemClock};

/// Manager object for one device's channel table and transfer queue.
pub struct TwinCore {
    registry: Registry,
    scheduler: Scheduler,
    config: Config,
}

impl TwinCore {
    pub fn new(config: Config, clock: Arc<dyn Clock + Send + Sync>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            registry: Registry::with_config(&config.channels, clock.clone()),
            scheduler: Scheduler::new(&config.scheduler, clock),
            config,
        })
    }

    /// Default configuration on the wall clock.
    pub fn with_defaults() -> Self {
        let config = Config::default();
        let clock: Arc<dyn Clock + Send + Sync> = Arc::new(SystemClock::new());
        Self {
            registry: Registry::with_config(&config.channels, clock.clone()),
            scheduler: Scheduler::new(&config.scheduler, clock),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ── Channels ─────────────────────────────────────────────────────────────

    pub fn attach(&mut self, kind: ChannelKind, sink: Box<dyn ChannelSink>) {
        self.registry.attach(kind, sink);
    }

    pub fn on_status_change(&mut self, observer: StatusObserver) {
        self.registry.set_observer(observer);
    }

    pub fn establish(&mut self, kind: ChannelKind, timeout_ms: u32) -> bool {
        self.registry.establish(kind, timeout_ms)
    }

    pub fn disconnect(&mut self, kind: ChannelKind) {
        self.registry.disconnect(kind);
    }

    pub fn reset(&mut self, kind: ChannelKind) {
        self.registry.reset(kind);
    }

    pub fn is_connected(&self, kind: ChannelKind) -> bool {
        self.registry.is_connected(kind)
    }

    pub fn status(&self, kind: ChannelKind) -> ChannelStatus {
        self.registry.status(kind)
    }

    pub fn best_channel(&self, min_stealth: u8, min_speed_kbps: u32, require_bidirectional: bool) -> ChannelKind {
        arbiter::best_channel(&self.registry, min_stealth, min_speed_kbps, require_bidirectional)
    }

    pub fn send_data(&mut self, data: &[u8], preferred: Option<ChannelKind>) -> Result<ChannelKind, ArbiterError> {
        arbiter::send_data(&mut self.registry, data, preferred)
    }

    // ── Transfers ────────────────────────────────────────────────────────────

    pub fn queue_data(
        &mut self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
        policy: Policy,
        chunked: bool,
    ) -> Result<(), SchedulerError> {
        self.scheduler.queue_data(name, data.into(), policy, chunked)
    }

    pub fn tick(&mut self) -> TickReport {
        self.scheduler.tick(&mut self.registry)
    }

    /// Tick until the queue drains or `max_ticks` pass. Returns the ticks used.
    pub fn run_until_idle(&mut self, max_ticks: u64) -> u64 {
        let mut n = 0;
        while n < max_ticks && !self.scheduler.is_empty() {
            self.tick();
            n += 1;
        }
        n
    }

    pub fn is_complete(&self, name: &str) -> bool {
        self.scheduler.is_complete(name)
    }

    pub fn job(&self, name: &str) -> Option<&TransferJob> {
        self.scheduler.job(name)
    }

    pub fn set_channel_enabled(&mut self, kind: ChannelKind, enabled: bool) {
        self.scheduler.set_channel_enabled(kind, enabled);
    }

    pub fn set_parallel_mode(&mut self, enabled: bool, max_channels: usize) {
        self.scheduler.set_parallel_mode(enabled, max_channels);
    }
}

impl Default for TwinCore {
    fn default() -> Self {
        Self::with_defaults()
    }
}
