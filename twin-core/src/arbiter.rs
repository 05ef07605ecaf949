//! Channel selection over the registry.

use serde::{Deserialize, Serialize};

use crate::registry::{Channel, ChannelKind, ChannelStatus, Registry};

/// Ranking policy for transfer jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Highest `speed_kbps`.
    Speed,
    /// Highest stealth rating.
    Stealth,
    /// Highest reliability rating.
    Reliability,
}

impl Policy {
    fn rating(self, ch: &Channel) -> u32 {
        match self {
            Policy::Speed => ch.profile.speed_kbps,
            Policy::Stealth => u32::from(ch.profile.stealth),
            Policy::Reliability => u32::from(ch.profile.reliability),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArbiterError {
    #[error("nothing to send")]
    EmptyPayload,
    #[error("no connected channel")]
    NoChannel,
    #[error("send failed on every connected channel ({attempted} tried)")]
    AllFailed { attempted: usize },
}

/// Lowest-priority CONNECTED channel meeting every constraint; ties go to the first
/// enumerated. When nothing qualifies this returns `ChannelKind::FALLBACK` whatever its
/// status, so callers needing a strict match must check the result.
pub fn best_channel(
    registry: &Registry,
    min_stealth: u8,
    min_speed_kbps: u32,
    require_bidirectional: bool,
) -> ChannelKind {
    registry
        .channels()
        .iter()
        .filter(|ch| {
            ch.status == ChannelStatus::Connected
                && ch.profile.stealth >= min_stealth
                && ch.profile.speed_kbps >= min_speed_kbps
                && (!require_bidirectional || ch.profile.bidirectional)
        })
        // min_by_key keeps the first of equal keys.
        .min_by_key(|ch| ch.profile.priority)
        .map(|ch| ch.kind)
        .unwrap_or(ChannelKind::FALLBACK)
}

/// Send `data` on the first channel that accepts it: `preferred` first (if CONNECTED),
/// then every CONNECTED channel in ascending priority, enumeration order within a level.
/// Each attempt updates that channel's `last_used` or failure counters. Empty data is
/// refused before any channel is touched.
pub fn send_data(
    registry: &mut Registry,
    data: &[u8],
    preferred: Option<ChannelKind>,
) -> Result<ChannelKind, ArbiterError> {
    if data.is_empty() {
        return Err(ArbiterError::EmptyPayload);
    }
    let mut attempted = 0;
    let mut tried_preferred = None;

    if let Some(kind) = preferred {
        if registry.is_connected(kind) {
            attempted += 1;
            tried_preferred = Some(kind);
            if registry.dispatch(kind, data) {
                return Ok(kind);
            }
            tracing::debug!(%kind, "preferred channel failed; falling back");
        }
    }

    let max_priority = registry
        .channels()
        .iter()
        .map(|ch| ch.profile.priority)
        .max()
        .unwrap_or(0);
    for level in 1..=max_priority {
        for kind in ChannelKind::ALL {
            if Some(kind) == tried_preferred {
                continue;
            }
            let ch = registry.channel(kind);
            if ch.profile.priority != level || ch.status != ChannelStatus::Connected {
                continue;
            }
            attempted += 1;
            if registry.dispatch(kind, data) {
                return Ok(kind);
            }
        }
    }

    if attempted == 0 {
        Err(ArbiterError::NoChannel)
    } else {
        tracing::warn!(attempted, len = data.len(), "send failed on every connected channel");
        Err(ArbiterError::AllFailed { attempted })
    }
}

/// Highest-rated CONNECTED channel under `policy` among those `eligible` admits.
/// Ties go to the lowest index; a zero rating never wins.
pub fn best_for_policy<F>(registry: &Registry, policy: Policy, eligible: F) -> Option<ChannelKind>
where
    F: Fn(ChannelKind) -> bool,
{
    let mut best: Option<(ChannelKind, u32)> = None;
    for ch in registry.channels() {
        if ch.status != ChannelStatus::Connected || !eligible(ch.kind) {
            continue;
        }
        let rating = policy.rating(ch);
        if rating > best.map_or(0, |(_, r)| r) {
            best = Some((ch.kind, rating));
        }
    }
    best.map(|(kind, _)| kind)
}
