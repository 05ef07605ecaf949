//! Channel traffic relayed over the inter-controller link.
//!
//! Channels whose medium lives on the other controller (radio, network) are reached by
//! streaming their bytes across the `Link` tagged with the channel id. Every such sink
//! shares one link; establishing a relayed channel is a PING round trip.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::LinkConfig;
use crate::link::{Link, LinkError};
use crate::protocol::{Command, EventId, StatusCode};
use crate::registry::{ChannelKind, ChannelSink};
use crate::transport::Transport;

/// A `Link` shared between relay sinks and the host, with the configured timeouts.
pub struct SharedLink<T: Transport> {
    inner: Arc<Mutex<Link<T>>>,
    config: LinkConfig,
}

impl<T: Transport> Clone for SharedLink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: Transport> SharedLink<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        let link = Link::new(transport).with_poll_interval(config.poll_interval_ms);
        Self {
            inner: Arc::new(Mutex::new(link)),
            config,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Link<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// `send_command` with the configured command timeout.
    pub fn command(&self, command: Command, data: &[u8], response: Option<&mut [u8]>) -> Result<usize, LinkError> {
        self.lock()
            .send_command(command, data, response, self.config.command_timeout_ms)
    }

    /// PING the peer; true when it answers SUCCESS within `timeout_ms`.
    pub fn ping(&self, timeout_ms: u32) -> bool {
        let mut status = [0xFFu8; 1];
        match self.lock().send_command(Command::Ping, &[], Some(&mut status), timeout_ms) {
            Ok(1) => status[0] == StatusCode::Success as u8,
            Ok(_) => false,
            Err(e) => {
                tracing::debug!(error = %e, "ping failed");
                false
            }
        }
    }

    pub fn trigger_event(&self, event: EventId, data: &[u8]) -> Result<u16, LinkError> {
        self.lock().trigger_event(event, data)
    }

    /// `wait_for_event` with the configured event timeout. Holds the link for the wait.
    pub fn wait_for_event(&self, event: EventId) -> Result<Vec<u8>, LinkError> {
        self.lock().wait_for_event(event, self.config.event_timeout_ms)
    }

    /// Sink for `kind` relayed over this link.
    pub fn sink(&self, kind: ChannelKind) -> RelaySink<T> {
        RelaySink {
            link: self.clone(),
            kind,
        }
    }
}

/// Channel sink that streams over the shared link with the channel's id.
pub struct RelaySink<T: Transport> {
    link: SharedLink<T>,
    kind: ChannelKind,
}

impl<T: Transport + Send> ChannelSink for RelaySink<T> {
    fn send(&mut self, data: &[u8]) -> bool {
        match self.link.lock().send_data(self.kind.id(), data) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(kind = %self.kind, error = %e, "relay send failed");
                false
            }
        }
    }

    fn establish(&mut self, timeout_ms: u32) -> bool {
        self.link.ping(timeout_ms)
    }
}
