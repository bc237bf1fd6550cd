use serde::Deserialize;
use std::time::Duration;

/// Reserved at the end of a bounded shutdown for the final nacks and ack flush.
pub(crate) const FINAL_NACK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Let running callbacks finish, up to the grace period.
    #[default]
    WaitForProcessing,
    /// Nack everything outstanding without waiting for callbacks.
    NackImmediately,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownSettings {
    pub mode: ShutdownMode,
    /// Overall bound on shutdown. `None` waits for callbacks indefinitely.
    pub timeout: Option<Duration>,
}

impl ShutdownSettings {
    pub fn wait_for_processing(timeout: Option<Duration>) -> Self {
        Self {
            mode: ShutdownMode::WaitForProcessing,
            timeout,
        }
    }

    pub fn nack_immediately() -> Self {
        Self {
            mode: ShutdownMode::NackImmediately,
            timeout: None,
        }
    }

    /// How long callbacks may keep running once draining starts; `None` is unbounded.
    pub(crate) fn grace_period(&self) -> Option<Duration> {
        match self.mode {
            ShutdownMode::NackImmediately => Some(Duration::ZERO),
            ShutdownMode::WaitForProcessing => self
                .timeout
                .map(|timeout| timeout.saturating_sub(FINAL_NACK_TIMEOUT)),
        }
    }
}
