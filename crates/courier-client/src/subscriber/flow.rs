// Inbound admission: bounds messages handed to the application but not yet resolved.
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{FlowControlSettings, LimitBehavior};
use crate::error::FlowControlError;
use crate::flow_control::{FlowController, FlowReservation};
#[cfg(test)]
use crate::flow_control::FlowUsage;

pub(crate) struct SubscriberFlowController {
    inner: Arc<FlowController>,
}

impl SubscriberFlowController {
    /// Inbound admission never fails a delivered message, so `ThrowException`
    /// behaves like `Block` here.
    pub(crate) fn new(mut settings: FlowControlSettings) -> Self {
        if settings.limit_behavior == LimitBehavior::ThrowException {
            tracing::debug!("subscriber flow control treats throw_exception as block");
            settings.limit_behavior = LimitBehavior::Block;
        }
        Self {
            inner: FlowController::new(settings, "subscriber"),
        }
    }

    /// Waits until one more message of `bytes` fits. A message larger than the
    /// byte ceiling is charged at the ceiling, so it is admitted alone.
    /// Returns `None` when `cancel` fires first.
    pub(crate) async fn admit(
        &self,
        bytes: u64,
        cancel: &CancellationToken,
    ) -> Option<FlowReservation> {
        let settings = self.inner.settings();
        let charged = match (settings.limit_behavior, settings.max_outstanding_bytes) {
            (LimitBehavior::Block, max) if max > 0 => bytes.min(max),
            _ => bytes,
        };
        match self.inner.reserve_with_cancellation(1, charged, cancel).await {
            Ok(reservation) => Some(reservation),
            Err(FlowControlError::Cancelled) => None,
            Err(err) => {
                tracing::warn!(error = %err, bytes, "inbound admission refused");
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn usage(&self) -> FlowUsage {
        self.inner.usage()
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self) -> usize {
        self.inner.waiting()
    }
}
