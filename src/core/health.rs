//! Link health ("meatball") state machine
//!
//! Each port reports Live, Degraded or Lost. Silence is measured in read
//! timeout ticks; a parsed sentence always brings the link back to Live.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Silence before a link is considered degraded
pub const DEFAULT_DEGRADED_AFTER: Duration = Duration::from_secs(5);

/// Silence before a link is considered lost
pub const DEFAULT_LOST_AFTER: Duration = Duration::from_secs(60);

/// Liveness of one instrument link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    /// Sentences are arriving
    Live,
    /// Quiet for longer than the degraded threshold
    Degraded,
    /// Quiet past the lost threshold, faulted, or stopped
    Lost,
}

impl LinkHealth {
    /// Indicator color used by operator screens
    pub fn color(&self) -> &'static str {
        match self {
            Self::Live => "green",
            Self::Degraded => "yellow",
            Self::Lost => "red",
        }
    }
}

impl fmt::Display for LinkHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Lost => write!(f, "Lost"),
        }
    }
}

/// Tick-driven health machine for one port. Pure; no I/O.
///
/// Every method that can change state returns `Some(new_state)` exactly when
/// the state changed, so callers can report transitions rather than snapshots.
#[derive(Debug, Clone)]
pub struct LinkHealthMonitor {
    state: LinkHealth,
    silent_ticks: u32,
    degraded_ticks: u32,
    lost_ticks: u32,
}

impl Default for LinkHealthMonitor {
    fn default() -> Self {
        Self::new(1, 12)
    }
}

impl LinkHealthMonitor {
    /// Monitor starting Live with explicit tick thresholds
    pub fn new(degraded_ticks: u32, lost_ticks: u32) -> Self {
        let degraded_ticks = degraded_ticks.max(1);
        Self {
            state: LinkHealth::Live,
            silent_ticks: 0,
            degraded_ticks,
            lost_ticks: lost_ticks.max(degraded_ticks),
        }
    }

    /// Monitor whose thresholds are durations measured in `tick` intervals
    pub fn for_tick(tick: Duration, degraded_after: Duration, lost_after: Duration) -> Self {
        Self::new(ticks_for(degraded_after, tick), ticks_for(lost_after, tick))
    }

    /// Start in `state` instead of Live
    #[must_use]
    pub fn with_initial(mut self, state: LinkHealth) -> Self {
        self.state = state;
        self
    }

    /// A read timed out with no data
    pub fn on_timeout_tick(&mut self) -> Option<LinkHealth> {
        self.silent_ticks = self.silent_ticks.saturating_add(1);

        if self.silent_ticks >= self.lost_ticks {
            self.transition(LinkHealth::Lost)
        } else if self.silent_ticks >= self.degraded_ticks && self.state == LinkHealth::Live {
            self.transition(LinkHealth::Degraded)
        } else {
            None
        }
    }

    /// A sentence was received and parsed
    pub fn on_sentence_parsed(&mut self) -> Option<LinkHealth> {
        self.silent_ticks = 0;
        self.transition(LinkHealth::Live)
    }

    /// Fault or shutdown
    pub fn force_lost(&mut self) -> Option<LinkHealth> {
        self.transition(LinkHealth::Lost)
    }

    /// Current state
    pub fn current_state(&self) -> LinkHealth {
        self.state
    }

    /// Consecutive silent ticks
    pub fn silent_ticks(&self) -> u32 {
        self.silent_ticks
    }

    fn transition(&mut self, to: LinkHealth) -> Option<LinkHealth> {
        if self.state == to {
            return None;
        }
        self.state = to;
        Some(to)
    }
}

fn ticks_for(after: Duration, tick: Duration) -> u32 {
    if tick.is_zero() {
        return 1;
    }
    let ticks = after.as_nanos().div_ceil(tick.as_nanos());
    u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
}
