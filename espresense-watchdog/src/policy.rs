use crate::models::DeviceState;
use time::{Duration, OffsetDateTime};

pub const DEFAULT_SILENCE_THRESHOLD: Duration = Duration::seconds(300);
pub const DEFAULT_MAX_UPTIME: Duration = Duration::hours(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Healthy,
    RestartDueToSilence,
    RestartDueToUptime,
}

impl Decision {
    pub fn needs_restart(self) -> bool {
        !matches!(self, Decision::Healthy)
    }

    pub fn reason(self) -> &'static str {
        match self {
            Decision::Healthy => "healthy",
            Decision::RestartDueToSilence => "silence",
            Decision::RestartDueToUptime => "uptime",
        }
    }
}

/// Thresholds deciding when a room gets restarted. Both are strict: a gap
/// equal to the threshold is still healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub silence_threshold: Duration,
    pub max_uptime: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            max_uptime: DEFAULT_MAX_UPTIME,
        }
    }
}

impl RestartPolicy {
    /// Silence wins over uptime: a silent room never reports the uptime reason.
    pub fn evaluate(&self, state: &DeviceState, now: OffsetDateTime) -> Decision {
        if now - state.last_seen > self.silence_threshold {
            Decision::RestartDueToSilence
        } else if now - state.last_restarted > self.max_uptime {
            Decision::RestartDueToUptime
        } else {
            Decision::Healthy
        }
    }
}
