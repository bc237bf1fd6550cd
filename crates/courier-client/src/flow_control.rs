// Outstanding byte/element accounting shared by publishers and subscribers.
//! Purpose:
//! Bound the work a client holds in memory. Publishers reserve before a
//! message enters a batch; subscribers reserve before a message reaches the
//! application callback.
//!
//! Design notes:
//! - Waiters are served strictly FIFO. A small request never overtakes a large
//!   one queued before it.
//! - Counters only move under the mutex and use checked arithmetic, so they
//!   never go negative and never exceed a ceiling under `Block`.
//! - A reservation is an owned guard. Releasing consumes it, and dropping an
//!   unreleased guard releases it, so one grant is returned at most once.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{FlowControlSettings, LimitBehavior};
use crate::error::FlowControlError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlowUsage {
    pub elements: u64,
    pub bytes: u64,
}

struct Waiter {
    id: u64,
    elements: u64,
    bytes: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct FlowState {
    usage: FlowUsage,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

/// Non-blocking probe result.
#[derive(Debug)]
pub enum ReserveOutcome {
    Granted(FlowReservation),
    /// Would have to wait under `Block`.
    Blocked,
    Rejected(FlowControlError),
}

pub struct FlowController {
    settings: FlowControlSettings,
    state: Mutex<FlowState>,
    side: &'static str,
}

impl FlowController {
    /// `side` labels metrics (`publisher` / `subscriber`).
    pub fn new(settings: FlowControlSettings, side: &'static str) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state: Mutex::new(FlowState::default()),
            side,
        })
    }

    pub fn settings(&self) -> &FlowControlSettings {
        &self.settings
    }

    pub fn usage(&self) -> FlowUsage {
        self.state.lock().usage
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Reserves capacity, suspending under `Block` until it fits.
    pub async fn reserve(
        self: &Arc<Self>,
        elements: u64,
        bytes: u64,
    ) -> Result<FlowReservation, FlowControlError> {
        self.reserve_inner(elements, bytes, None).await
    }

    /// Like [`FlowController::reserve`], but `cancel` aborts a suspended wait with
    /// [`FlowControlError::Cancelled`].
    pub async fn reserve_with_cancellation(
        self: &Arc<Self>,
        elements: u64,
        bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<FlowReservation, FlowControlError> {
        self.reserve_inner(elements, bytes, Some(cancel)).await
    }

    pub fn try_reserve(self: &Arc<Self>, elements: u64, bytes: u64) -> ReserveOutcome {
        let mut state = self.state.lock();
        match self.admit(&state, elements, bytes) {
            Admission::Grant => {
                self.charge(&mut state, elements, bytes);
                ReserveOutcome::Granted(FlowReservation::new(self.clone(), elements, bytes))
            }
            Admission::Wait => ReserveOutcome::Blocked,
            Admission::Reject(err) => ReserveOutcome::Rejected(err),
        }
    }

    /// Returns capacity that is not tracked by a [`FlowReservation`].
    /// Releasing more than is outstanding is rejected and changes nothing.
    pub fn release(&self, elements: u64, bytes: u64) -> Result<(), FlowControlError> {
        let mut state = self.state.lock();
        self.release_locked(&mut state, elements, bytes)
    }

    async fn reserve_inner(
        self: &Arc<Self>,
        elements: u64,
        bytes: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlowReservation, FlowControlError> {
        let mut wait = {
            let mut state = self.state.lock();
            match self.admit(&state, elements, bytes) {
                Admission::Grant => {
                    self.charge(&mut state, elements, bytes);
                    return Ok(FlowReservation::new(self.clone(), elements, bytes));
                }
                Admission::Reject(err) => return Err(err),
                Admission::Wait => {}
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            let (grant, granted) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                elements,
                bytes,
                grant,
            });
            metrics::counter!("courier_flow_control_blocked_total", "side" => self.side)
                .increment(1);
            tracing::trace!(side = self.side, elements, bytes, "flow control reservation queued");
            WaitGuard {
                controller: self.clone(),
                id,
                elements,
                bytes,
                granted: Some(granted),
            }
        };
        let Some(granted) = wait.granted.as_mut() else {
            return Err(FlowControlError::Cancelled);
        };
        let result: Result<(), oneshot::error::RecvError> = match cancel {
            Some(cancel) => tokio::select! {
                result = granted => result,
                _ = cancel.cancelled() => return Err(FlowControlError::Cancelled),
            },
            None => granted.await,
        };
        // The waiter has left the queue; any charge now belongs to the returned reservation.
        wait.granted = None;
        match result {
            Ok(()) => Ok(FlowReservation::new(self.clone(), elements, bytes)),
            Err(_) => Err(FlowControlError::Cancelled),
        }
    }

    fn admit(&self, state: &FlowState, elements: u64, bytes: u64) -> Admission {
        if self.settings.limit_behavior == LimitBehavior::Ignore {
            return Admission::Grant;
        }
        let max_elements = self.settings.max_outstanding_elements;
        let max_bytes = self.settings.max_outstanding_bytes;
        if max_elements > 0 && elements > max_elements {
            return Admission::Reject(FlowControlError::MaxOutstandingElements {
                limit: max_elements,
            });
        }
        if max_bytes > 0 && bytes > max_bytes {
            return Admission::Reject(FlowControlError::RequestTooLarge {
                requested: bytes,
                limit: max_bytes,
            });
        }
        let exceeded = if max_elements > 0 && state.usage.elements + elements > max_elements {
            Some(FlowControlError::MaxOutstandingElements {
                limit: max_elements,
            })
        } else if max_bytes > 0 && state.usage.bytes + bytes > max_bytes {
            Some(FlowControlError::MaxOutstandingBytes { limit: max_bytes })
        } else {
            None
        };
        match (self.settings.limit_behavior, exceeded) {
            (LimitBehavior::Block, None) if state.waiters.is_empty() => Admission::Grant,
            (LimitBehavior::Block, _) => Admission::Wait,
            (_, None) => Admission::Grant,
            (_, Some(err)) => Admission::Reject(err),
        }
    }

    fn fits(&self, usage: FlowUsage, elements: u64, bytes: u64) -> bool {
        let max_elements = self.settings.max_outstanding_elements;
        let max_bytes = self.settings.max_outstanding_bytes;
        (max_elements == 0 || usage.elements + elements <= max_elements)
            && (max_bytes == 0 || usage.bytes + bytes <= max_bytes)
    }

    fn charge(&self, state: &mut FlowState, elements: u64, bytes: u64) {
        state.usage.elements += elements;
        state.usage.bytes += bytes;
    }

    fn release_locked(
        &self,
        state: &mut FlowState,
        elements: u64,
        bytes: u64,
    ) -> Result<(), FlowControlError> {
        let (Some(next_elements), Some(next_bytes)) = (
            state.usage.elements.checked_sub(elements),
            state.usage.bytes.checked_sub(bytes),
        ) else {
            tracing::warn!(side = self.side, elements, bytes, "flow control over-release rejected");
            return Err(FlowControlError::OverRelease { elements, bytes });
        };
        state.usage.elements = next_elements;
        state.usage.bytes = next_bytes;
        self.wake_waiters(state);
        Ok(())
    }

    fn wake_waiters(&self, state: &mut FlowState) {
        while let Some(head) = state.waiters.front() {
            if !self.fits(state.usage, head.elements, head.bytes) {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.grant.send(()).is_ok() {
                self.charge(state, waiter.elements, waiter.bytes);
            }
        }
    }
}

enum Admission {
    Grant,
    Wait,
    Reject(FlowControlError),
}

// Removes an abandoned waiter, or hands back a grant that raced with cancellation.
struct WaitGuard {
    controller: Arc<FlowController>,
    id: u64,
    elements: u64,
    bytes: u64,
    granted: Option<oneshot::Receiver<()>>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.granted.is_none() {
            return;
        }
        let mut state = self.controller.state.lock();
        if let Some(index) = state.waiters.iter().position(|waiter| waiter.id == self.id) {
            state.waiters.remove(index);
            // The head may have been the only thing blocking the next waiter.
            self.controller.wake_waiters(&mut state);
        } else {
            let _ = self
                .controller
                .release_locked(&mut state, self.elements, self.bytes);
        }
    }
}

/// Capacity held against a [`FlowController`] until released or dropped.
pub struct FlowReservation {
    controller: Arc<FlowController>,
    elements: u64,
    bytes: u64,
    released: bool,
}

impl FlowReservation {
    fn new(controller: Arc<FlowController>, elements: u64, bytes: u64) -> Self {
        Self {
            controller,
            elements,
            bytes,
            released: false,
        }
    }

    pub fn elements(&self) -> u64 {
        self.elements
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn release(mut self) -> Result<(), FlowControlError> {
        self.released = true;
        self.controller.release(self.elements, self.bytes)
    }
}

impl Drop for FlowReservation {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.controller.release(self.elements, self.bytes);
        }
    }
}

impl std::fmt::Debug for FlowReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowReservation")
            .field("elements", &self.elements)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller(elements: u64, bytes: u64, behavior: LimitBehavior) -> Arc<FlowController> {
        FlowController::new(
            FlowControlSettings {
                max_outstanding_elements: elements,
                max_outstanding_bytes: bytes,
                limit_behavior: behavior,
            },
            "test",
        )
    }

    #[tokio::test]
    async fn throw_exception_rejects_when_full() {
        let flow = controller(2, 100, LimitBehavior::ThrowException);
        let first = flow.reserve(1, 60).await.expect("first");
        let err = flow.reserve(1, 60).await.expect_err("bytes full");
        assert_eq!(err, FlowControlError::MaxOutstandingBytes { limit: 100 });
        let _second = flow.reserve(1, 40).await.expect("second");
        let err = flow.reserve(1, 0).await.expect_err("elements full");
        assert_eq!(err, FlowControlError::MaxOutstandingElements { limit: 2 });
        first.release().expect("release");
        assert_eq!(flow.usage(), FlowUsage { elements: 1, bytes: 40 });
    }

    #[tokio::test]
    async fn zero_ceiling_disables_check() {
        let flow = controller(0, 10, LimitBehavior::ThrowException);
        let mut held = Vec::new();
        for _ in 0..100 {
            held.push(flow.reserve(1, 0).await.expect("unbounded elements"));
        }
        assert_eq!(flow.usage().elements, 100);
        assert!(flow.reserve(1, 11).await.is_err());
    }

    #[tokio::test]
    async fn ignore_counts_but_never_refuses() {
        let flow = controller(1, 1, LimitBehavior::Ignore);
        let _a = flow.reserve(5, 500).await.expect("a");
        let _b = flow.reserve(5, 500).await.expect("b");
        assert_eq!(flow.usage(), FlowUsage { elements: 10, bytes: 1000 });
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_under_block() {
        let flow = controller(10, 100, LimitBehavior::Block);
        let err = flow.reserve(1, 101).await.expect_err("too large");
        assert_eq!(
            err,
            FlowControlError::RequestTooLarge {
                requested: 101,
                limit: 100
            }
        );
        assert_eq!(flow.waiting(), 0);
    }

    #[tokio::test]
    async fn block_waits_and_serves_fifo() {
        let flow = controller(0, 100, LimitBehavior::Block);
        let held = flow.reserve(1, 100).await.expect("fill");

        let big_flow = flow.clone();
        let big = tokio::spawn(async move { big_flow.reserve(1, 80).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let small_flow = flow.clone();
        let small = tokio::spawn(async move { small_flow.reserve(1, 10).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flow.waiting(), 2);
        assert!(matches!(flow.try_reserve(1, 1), ReserveOutcome::Blocked));

        drop(held);
        let big = big.await.expect("join").expect("big granted");
        let small = small.await.expect("join").expect("small granted");
        assert_eq!(flow.usage().bytes, 90);
        drop(big);
        drop(small);
        assert_eq!(flow.usage(), FlowUsage::default());
    }

    #[tokio::test]
    async fn cancellation_unblocks_waiter_and_frees_queue() {
        let flow = controller(1, 0, LimitBehavior::Block);
        let held = flow.reserve(1, 0).await.expect("fill");
        let cancel = CancellationToken::new();
        let waiter_flow = flow.clone();
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            waiter_flow
                .reserve_with_cancellation(1, 0, &waiter_cancel)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flow.waiting(), 1);
        cancel.cancel();
        let err = waiter.await.expect("join").expect_err("cancelled");
        assert_eq!(err, FlowControlError::Cancelled);
        assert_eq!(flow.waiting(), 0);
        drop(held);
        assert_eq!(flow.usage(), FlowUsage::default());
    }

    #[tokio::test]
    async fn dropped_wait_does_not_leak_capacity() {
        let flow = controller(1, 0, LimitBehavior::Block);
        let held = flow.reserve(1, 0).await.expect("fill");
        let pending = flow.reserve(1, 0);
        let timed_out = tokio::time::timeout(Duration::from_millis(5), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(flow.waiting(), 0);
        drop(held);
        let again = flow.reserve(1, 0).await.expect("capacity available");
        drop(again);
        assert_eq!(flow.usage(), FlowUsage::default());
    }

    #[tokio::test]
    async fn double_release_never_double_decrements() {
        let flow = controller(10, 100, LimitBehavior::Block);
        let reservation = flow.reserve(2, 20).await.expect("reserve");
        reservation.release().expect("first release");
        let err = flow.release(2, 20).expect_err("second release");
        assert_eq!(err, FlowControlError::OverRelease { elements: 2, bytes: 20 });
        assert_eq!(flow.usage(), FlowUsage::default());
    }

    #[tokio::test]
    async fn counters_stay_within_ceiling_under_contention() {
        let flow = controller(3, 30, LimitBehavior::Block);
        let mut tasks = Vec::new();
        for i in 0..20u64 {
            let flow = flow.clone();
            tasks.push(tokio::spawn(async move {
                let reservation = flow.reserve(1, 5 + i % 5).await.expect("reserve");
                let usage = flow.usage();
                assert!(usage.elements <= 3);
                assert!(usage.bytes <= 30);
                tokio::time::sleep(Duration::from_millis(1)).await;
                drop(reservation);
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }
        assert_eq!(flow.usage(), FlowUsage::default());
    }
}
