use std::time::Duration;

/// How long to wait between a dropped connection and the next attempt.
///
/// Attempts are unbounded in count; only `disconnect()` stops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed { delay: Duration },
    /// Doubles per consecutive failure, capped at `max`. Resets after a
    /// connection reaches `Open`.
    Exponential { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based count of
    /// failures since the last successful open).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay } => delay,
            ReconnectPolicy::Exponential { initial, max } => {
                let factor = 1u32 << attempt.min(16);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}
