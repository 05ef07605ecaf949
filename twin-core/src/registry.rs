//! Channel registry: the fixed table of logical channels, their capability
//! ratings, and the status state machine.
//!
//! `CONNECTED` is the only status eligible for arbitration. A channel is demoted
//! to `ERROR` once its consecutive send failures exceed the configured threshold
//! and stays there until `reset`; the registry never heals a channel on its own.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ChannelOverride, ChannelsConfig, DEFAULT_ERROR_THRESHOLD};
use crate::transport::Clock;

/// Number of logical channels.
pub const CHANNEL_COUNT: usize = 7;

/// Logical channel identity, in enumeration (tie-break) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Keyboard,
    Mouse,
    Nic,
    MassStorage,
    Bluetooth,
    Wifi,
    HidRaw,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; CHANNEL_COUNT] = [
        ChannelKind::Keyboard,
        ChannelKind::Mouse,
        ChannelKind::Nic,
        ChannelKind::MassStorage,
        ChannelKind::Bluetooth,
        ChannelKind::Wifi,
        ChannelKind::HidRaw,
    ];

    /// Channel returned by arbitration when nothing qualifies.
    pub const FALLBACK: ChannelKind = ChannelKind::Keyboard;

    pub fn index(self) -> usize {
        self as usize
    }

    /// Channel id carried on the inter-controller link.
    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Host-input channels exist from power-up; everything else needs establishing.
    pub fn initial_status(self) -> ChannelStatus {
        match self {
            ChannelKind::Keyboard | ChannelKind::Mouse => ChannelStatus::Available,
            _ => ChannelStatus::Unavailable,
        }
    }

    pub fn default_profile(self) -> ChannelProfile {
        let (priority, speed_kbps, stealth, reliability, bidirectional) = match self {
            ChannelKind::Keyboard => (7, 1, 1, 10, false),
            ChannelKind::Mouse => (6, 1, 3, 9, false),
            ChannelKind::Nic => (1, 100_000, 5, 7, true),
            ChannelKind::MassStorage => (2, 400_000, 6, 8, true),
            ChannelKind::Bluetooth => (4, 2_000, 7, 5, true),
            ChannelKind::Wifi => (3, 50_000, 8, 6, true),
            ChannelKind::HidRaw => (5, 64, 4, 4, true),
        };
        ChannelProfile {
            priority,
            speed_kbps,
            stealth,
            reliability,
            bidirectional,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelKind::Keyboard => "keyboard",
            ChannelKind::Mouse => "mouse",
            ChannelKind::Nic => "nic",
            ChannelKind::MassStorage => "mass_storage",
            ChannelKind::Bluetooth => "bluetooth",
            ChannelKind::Wifi => "wifi",
            ChannelKind::HidRaw => "hid_raw",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Unavailable,
    Available,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

/// Static capability ratings. Lower priority is preferred; the other scores are ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelProfile {
    pub priority: u8,
    pub speed_kbps: u32,
    pub stealth: u8,
    pub reliability: u8,
    pub bidirectional: bool,
}

impl ChannelProfile {
    fn apply(&mut self, o: &ChannelOverride) {
        if let Some(p) = o.priority {
            self.priority = p;
        }
        if let Some(s) = o.speed_kbps {
            self.speed_kbps = s;
        }
        if let Some(s) = o.stealth {
            self.stealth = s;
        }
        if let Some(r) = o.reliability {
            self.reliability = r;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub kind: ChannelKind,
    pub profile: ChannelProfile,
    pub status: ChannelStatus,
    /// `now_ms` of the last successful send, 0 if never.
    pub last_used: u32,
    /// Every failed send. Cleared only by `Registry::reset`.
    pub error_count: u32,
    /// Failures since the last success; drives the ERROR transition.
    pub consecutive_failures: u32,
}

impl Channel {
    fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            profile: kind.default_profile(),
            status: kind.initial_status(),
            last_used: 0,
            error_count: 0,
            consecutive_failures: 0,
        }
    }
}

/// Per-channel dispatch: the only thing the core knows about a channel's medium.
pub trait ChannelSink: Send {
    /// Send `data` over the channel. `false` is a failed send.
    fn send(&mut self, data: &[u8]) -> bool;

    /// Bring the underlying session up within `timeout_ms`. Channels with nothing to
    /// negotiate succeed immediately.
    fn establish(&mut self, _timeout_ms: u32) -> bool {
        true
    }
}

impl<F> ChannelSink for F
where
    F: FnMut(&[u8]) -> bool + Send,
{
    fn send(&mut self, data: &[u8]) -> bool {
        self(data)
    }
}

/// Called as `(kind, old, new)` on every real status transition.
pub type StatusObserver = Box<dyn FnMut(ChannelKind, ChannelStatus, ChannelStatus) + Send>;

pub struct Registry {
    channels: [Channel; CHANNEL_COUNT],
    sinks: [Option<Box<dyn ChannelSink>>; CHANNEL_COUNT],
    error_threshold: u32,
    observer: Option<StatusObserver>,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl Registry {
    pub fn new(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            channels: ChannelKind::ALL.map(Channel::new),
            sinks: Default::default(),
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            observer: None,
            clock,
        }
    }

    pub fn with_config(config: &ChannelsConfig, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let mut r = Self::new(clock);
        r.error_threshold = config.error_threshold;
        for (kind, o) in &config.overrides {
            r.channels[kind.index()].profile.apply(o);
        }
        r
    }

    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    pub fn error_threshold(&self) -> u32 {
        self.error_threshold
    }

    /// Install the sink for `kind`, replacing any previous one.
    pub fn attach(&mut self, kind: ChannelKind, sink: Box<dyn ChannelSink>) {
        self.sinks[kind.index()] = Some(sink);
    }

    pub fn detach(&mut self, kind: ChannelKind) -> Option<Box<dyn ChannelSink>> {
        self.sinks[kind.index()].take()
    }

    pub fn set_observer(&mut self, observer: StatusObserver) {
        self.observer = Some(observer);
    }

    pub fn channel(&self, kind: ChannelKind) -> &Channel {
        &self.channels[kind.index()]
    }

    /// All channels in enumeration order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn status(&self, kind: ChannelKind) -> ChannelStatus {
        self.channels[kind.index()].status
    }

    pub fn is_connected(&self, kind: ChannelKind) -> bool {
        self.status(kind) == ChannelStatus::Connected
    }

    pub fn set_status(&mut self, kind: ChannelKind, status: ChannelStatus) {
        let old = self.channels[kind.index()].status;
        if old == status {
            return;
        }
        self.channels[kind.index()].status = status;
        match status {
            ChannelStatus::Connected => tracing::info!(%kind, ?old, "channel connected"),
            ChannelStatus::Error => tracing::warn!(%kind, ?old, "channel demoted to error"),
            _ => tracing::debug!(%kind, ?old, new = ?status, "channel status changed"),
        }
        if let Some(observer) = self.observer.as_mut() {
            observer(kind, old, status);
        }
    }

    /// Run the channel's establishment routine. CONNECTING while it runs, CONNECTED on
    /// success, previous status restored on failure. Channels in ERROR must be reset first.
    pub fn establish(&mut self, kind: ChannelKind, timeout_ms: u32) -> bool {
        let prev = self.status(kind);
        match prev {
            ChannelStatus::Connected => return true,
            ChannelStatus::Error => return false,
            _ => {}
        }
        let Some(sink) = self.sinks[kind.index()].as_mut() else {
            tracing::debug!(%kind, "no sink attached; cannot establish");
            return false;
        };
        self.channels[kind.index()].status = ChannelStatus::Connecting;
        if let Some(observer) = self.observer.as_mut() {
            observer(kind, prev, ChannelStatus::Connecting);
        }
        let ok = sink.establish(timeout_ms);
        if ok {
            self.set_status(kind, ChannelStatus::Connected);
        } else {
            self.set_status(kind, prev);
        }
        ok
    }

    pub fn disconnect(&mut self, kind: ChannelKind) {
        self.set_status(kind, ChannelStatus::Disconnected);
    }

    /// External reconfiguration: clear failure counters and return an ERROR or
    /// DISCONNECTED channel to AVAILABLE.
    pub fn reset(&mut self, kind: ChannelKind) {
        let ch = &mut self.channels[kind.index()];
        ch.error_count = 0;
        ch.consecutive_failures = 0;
        if matches!(ch.status, ChannelStatus::Error | ChannelStatus::Disconnected) {
            self.set_status(kind, ChannelStatus::Available);
        }
    }

    /// Send through the channel's sink and account the outcome. A channel with no
    /// sink fails like any other send.
    pub fn dispatch(&mut self, kind: ChannelKind, data: &[u8]) -> bool {
        let ok = match self.sinks[kind.index()].as_mut() {
            Some(sink) => sink.send(data),
            None => false,
        };
        if ok {
            self.record_success(kind);
        } else {
            self.record_failure(kind);
        }
        ok
    }

    pub fn record_success(&mut self, kind: ChannelKind) {
        let now = self.clock.now_ms();
        let ch = &mut self.channels[kind.index()];
        ch.last_used = now;
        ch.consecutive_failures = 0;
    }

    /// Count a failed send; demotes to ERROR once the streak exceeds the threshold.
    pub fn record_failure(&mut self, kind: ChannelKind) {
        let ch = &mut self.channels[kind.index()];
        ch.error_count = ch.error_count.saturating_add(1);
        ch.consecutive_failures = ch.consecutive_failures.saturating_add(1);
        let streak = ch.consecutive_failures;
        tracing::debug!(%kind, streak, total = ch.error_count, "channel send failed");
        if streak > self.error_threshold && ch.status != ChannelStatus::Error {
            self.set_status(kind, ChannelStatus::Error);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Settable clock for deterministic timestamps.
    #[derive(Default)]
    pub(crate) struct ManualClock(pub AtomicU32);

    impl Clock for ManualClock {
        fn now_ms(&self) -> u32 {
            self.0.load(Ordering::Relaxed)
        }
        fn delay_ms(&self, ms: u32) {
            self.0.fetch_add(ms, Ordering::Relaxed);
        }
    }

    /// Sink that records sends and fails while `failing` is set, or once on attempt `fail_on`.
    #[derive(Clone, Default)]
    pub(crate) struct TestSink {
        pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
        pub failing: Arc<AtomicBool>,
        attempts: Arc<AtomicUsize>,
        fail_on: Arc<Mutex<Option<usize>>>,
    }

    impl TestSink {
        pub fn sends(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
        pub fn fail(&self, on: bool) {
            self.failing.store(on, Ordering::Relaxed);
        }
        /// Refuse only the send attempt numbered `attempt` (0-based, counted from now).
        pub fn fail_on(&self, attempt: usize) {
            let base = self.attempts.load(Ordering::Relaxed);
            *self.fail_on.lock().unwrap() = Some(base + attempt);
        }
    }

    impl ChannelSink for TestSink {
        fn send(&mut self, data: &[u8]) -> bool {
            let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
            if self.failing.load(Ordering::Relaxed) || *self.fail_on.lock().unwrap() == Some(attempt) {
                return false;
            }
            self.sent.lock().unwrap().push(data.to_vec());
            true
        }
    }

    pub(crate) fn registry() -> (Registry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (Registry::new(clock.clone()), clock)
    }

    /// Attach a fresh test sink to `kind` and connect it.
    pub(crate) fn connect(r: &mut Registry, kind: ChannelKind) -> TestSink {
        let sink = TestSink::default();
        r.attach(kind, Box::new(sink.clone()));
        assert!(r.establish(kind, 100));
        sink
    }

    #[test]
    fn initial_table() {
        let (r, _) = registry();
        assert_eq!(r.channels().len(), CHANNEL_COUNT);
        assert_eq!(r.status(ChannelKind::Keyboard), ChannelStatus::Available);
        assert_eq!(r.status(ChannelKind::Mouse), ChannelStatus::Available);
        assert_eq!(r.status(ChannelKind::Wifi), ChannelStatus::Unavailable);
        assert_eq!(r.channel(ChannelKind::Nic).profile.priority, 1);
        assert_eq!(r.channel(ChannelKind::MassStorage).profile.speed_kbps, 400_000);
        assert!(!r.channel(ChannelKind::Keyboard).profile.bidirectional);
        for (i, ch) in r.channels().iter().enumerate() {
            assert_eq!(ch.kind.index(), i);
            assert_eq!(ChannelKind::from_id(ch.kind.id()), Some(ch.kind));
        }
        assert_eq!(ChannelKind::from_id(7), None);
    }

    #[test]
    fn establish_without_sink_fails_and_keeps_status() {
        let (mut r, _) = registry();
        assert!(!r.establish(ChannelKind::Wifi, 100));
        assert_eq!(r.status(ChannelKind::Wifi), ChannelStatus::Unavailable);
    }

    #[test]
    fn failed_establish_restores_previous_status() {
        struct Refuses;
        impl ChannelSink for Refuses {
            fn send(&mut self, _: &[u8]) -> bool {
                true
            }
            fn establish(&mut self, _: u32) -> bool {
                false
            }
        }
        let (mut r, _) = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        r.set_observer(Box::new(move |k, old, new| log.lock().unwrap().push((k, old, new))));
        r.attach(ChannelKind::Bluetooth, Box::new(Refuses));
        assert!(!r.establish(ChannelKind::Bluetooth, 100));
        assert_eq!(r.status(ChannelKind::Bluetooth), ChannelStatus::Unavailable);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (ChannelKind::Bluetooth, ChannelStatus::Unavailable, ChannelStatus::Connecting),
                (ChannelKind::Bluetooth, ChannelStatus::Connecting, ChannelStatus::Unavailable),
            ]
        );
    }

    #[test]
    fn dispatch_updates_last_used() {
        let (mut r, clock) = registry();
        let sink = connect(&mut r, ChannelKind::Nic);
        clock.0.store(500, Ordering::Relaxed);
        assert!(r.dispatch(ChannelKind::Nic, b"abc"));
        assert_eq!(r.channel(ChannelKind::Nic).last_used, 500);
        assert_eq!(sink.sends(), vec![b"abc".to_vec()]);
    }

    #[test]
    fn fourth_consecutive_failure_demotes_to_error() {
        let (mut r, _) = registry();
        let sink = connect(&mut r, ChannelKind::Wifi);
        sink.fail(true);
        for _ in 0..3 {
            assert!(!r.dispatch(ChannelKind::Wifi, b"x"));
            assert_eq!(r.status(ChannelKind::Wifi), ChannelStatus::Connected);
        }
        assert!(!r.dispatch(ChannelKind::Wifi, b"x"));
        assert_eq!(r.status(ChannelKind::Wifi), ChannelStatus::Error);
        assert_eq!(r.channel(ChannelKind::Wifi).error_count, 4);
        // No self-healing, and establish refuses until reset.
        sink.fail(false);
        assert!(!r.establish(ChannelKind::Wifi, 100));
        assert_eq!(r.status(ChannelKind::Wifi), ChannelStatus::Error);
    }

    #[test]
    fn success_breaks_streak_but_keeps_error_count() {
        let (mut r, _) = registry();
        let sink = connect(&mut r, ChannelKind::Nic);
        for _ in 0..3 {
            sink.fail(true);
            r.dispatch(ChannelKind::Nic, b"x");
            r.dispatch(ChannelKind::Nic, b"x");
            r.dispatch(ChannelKind::Nic, b"x");
            sink.fail(false);
            r.dispatch(ChannelKind::Nic, b"x");
        }
        assert_eq!(r.status(ChannelKind::Nic), ChannelStatus::Connected);
        assert_eq!(r.channel(ChannelKind::Nic).error_count, 9);
        assert_eq!(r.channel(ChannelKind::Nic).consecutive_failures, 0);
    }

    #[test]
    fn reset_clears_counters_and_reopens() {
        let (mut r, _) = registry();
        let sink = connect(&mut r, ChannelKind::Wifi);
        sink.fail(true);
        for _ in 0..4 {
            r.dispatch(ChannelKind::Wifi, b"x");
        }
        r.reset(ChannelKind::Wifi);
        assert_eq!(r.status(ChannelKind::Wifi), ChannelStatus::Available);
        assert_eq!(r.channel(ChannelKind::Wifi).error_count, 0);
        sink.fail(false);
        assert!(r.establish(ChannelKind::Wifi, 100));
        assert!(r.is_connected(ChannelKind::Wifi));
    }

    #[test]
    fn observer_sees_only_real_transitions() {
        let (mut r, _) = registry();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        r.set_observer(Box::new(move |_, _, _| {
            c.fetch_add(1, Ordering::Relaxed);
        }));
        r.set_status(ChannelKind::Keyboard, ChannelStatus::Available);
        assert_eq!(count.load(Ordering::Relaxed), 0);
        r.disconnect(ChannelKind::Keyboard);
        r.disconnect(ChannelKind::Keyboard);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn closures_are_sinks() {
        let (mut r, _) = registry();
        r.attach(ChannelKind::HidRaw, Box::new(|d: &[u8]| d.len() < 4));
        assert!(r.establish(ChannelKind::HidRaw, 10));
        assert!(r.dispatch(ChannelKind::HidRaw, b"ok"));
        assert!(!r.dispatch(ChannelKind::HidRaw, b"too long"));
    }

    #[test]
    fn overrides_apply_to_profile() {
        let mut cfg = ChannelsConfig::default();
        cfg.error_threshold = 1;
        cfg.overrides.insert(
            ChannelKind::HidRaw,
            ChannelOverride {
                priority: Some(1),
                stealth: Some(9),
                ..Default::default()
            },
        );
        let r = Registry::with_config(&cfg, Arc::new(ManualClock::default()));
        let p = r.channel(ChannelKind::HidRaw).profile;
        assert_eq!((p.priority, p.stealth, p.speed_kbps), (1, 9, 64));
        assert_eq!(r.error_threshold(), 1);
    }
}
