// Lease bookkeeping for received-but-unresolved messages.
//! Each outstanding ack id has one lease. The extender asks for an
//! [`ExtensionPlan`] every check interval; leases inside the expiration padding
//! are pushed forward by the current extension, or forgotten once the total
//! extension bound from receipt would be crossed.
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{LeaseSettings, MAX_ACK_DEADLINE};

const LATENCY_BUCKETS: usize = MAX_ACK_DEADLINE.as_secs() as usize + 1;
const EXTENSION_PERCENTILE: f64 = 99.9;

/// Histogram of ack latencies in whole seconds over `0..=600`.
pub(crate) struct AckLatencyDistribution {
    buckets: Vec<u64>,
    count: u64,
}

impl AckLatencyDistribution {
    pub(crate) fn new() -> Self {
        Self {
            buckets: vec![0; LATENCY_BUCKETS],
            count: 0,
        }
    }

    /// Rounds up to whole seconds; anything above the top bucket lands in it.
    pub(crate) fn record(&mut self, latency: Duration) {
        let seconds = latency.as_secs_f64().ceil() as usize;
        self.buckets[seconds.min(LATENCY_BUCKETS - 1)] += 1;
        self.count += 1;
    }

    pub(crate) fn percentile(&self, percent: f64) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let rank = ((self.count as f64) * percent / 100.0).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (seconds, hits) in self.buckets.iter().enumerate() {
            seen += hits;
            if seen >= rank {
                return Some(Duration::from_secs(seconds as u64));
            }
        }
        Some(MAX_ACK_DEADLINE)
    }
}

struct Lease {
    received_at: Instant,
    deadline: Instant,
}

/// Work for one extension cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ExtensionPlan {
    pub(crate) extension_seconds: u32,
    pub(crate) extend: Vec<String>,
    /// Leases given up this cycle, keyed by the seconds left until their total
    /// expiration. They get one last modack for that remainder.
    pub(crate) final_modacks: BTreeMap<u32, Vec<String>>,
    pub(crate) forgotten: usize,
}

impl ExtensionPlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.extend.is_empty() && self.final_modacks.is_empty() && self.forgotten == 0
    }
}

struct LeaseState {
    leases: HashMap<String, Lease>,
    latencies: AckLatencyDistribution,
}

pub(crate) struct LeaseManager {
    settings: LeaseSettings,
    state: Mutex<LeaseState>,
}

impl LeaseManager {
    pub(crate) fn new(settings: LeaseSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(LeaseState {
                leases: HashMap::new(),
                latencies: AckLatencyDistribution::new(),
            }),
        }
    }

    /// Current extension: p99.9 of ack latency clamped to the extension bounds,
    /// or the stream ack deadline before any ack has been observed.
    pub(crate) fn extension(&self, exactly_once: bool) -> Duration {
        let state = self.state.lock();
        self.extension_locked(&state, exactly_once)
    }

    fn extension_locked(&self, state: &LeaseState, exactly_once: bool) -> Duration {
        let observed = state
            .latencies
            .percentile(EXTENSION_PERCENTILE)
            .unwrap_or_else(|| self.settings.stream_ack_deadline());
        let min = self.settings.min_extension(exactly_once);
        let max = self.settings.max_per_extension().max(min);
        observed.clamp(min, max)
    }

    /// Starts a lease. Returns false when `ack_id` is already leased.
    pub(crate) fn insert(&self, ack_id: &str, now: Instant, exactly_once: bool) -> bool {
        let mut state = self.state.lock();
        if state.leases.contains_key(ack_id) {
            return false;
        }
        let deadline = now + self.extension_locked(&state, exactly_once);
        state.leases.insert(
            ack_id.to_string(),
            Lease {
                received_at: now,
                deadline,
            },
        );
        metrics::gauge!("courier_sub_outstanding_leases").set(state.leases.len() as f64);
        true
    }

    pub(crate) fn contains(&self, ack_id: &str) -> bool {
        self.state.lock().leases.contains_key(ack_id)
    }

    /// Ends a lease without an ack (nack, rejected receipt, failed extension).
    pub(crate) fn remove(&self, ack_id: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.leases.remove(ack_id).is_some();
        metrics::gauge!("courier_sub_outstanding_leases").set(state.leases.len() as f64);
        removed
    }

    /// Ends a lease on ack and feeds its latency into the extension estimate.
    pub(crate) fn acked(&self, ack_id: &str, now: Instant) -> bool {
        let mut state = self.state.lock();
        let Some(lease) = state.leases.remove(ack_id) else {
            return false;
        };
        state
            .latencies
            .record(now.saturating_duration_since(lease.received_at));
        metrics::gauge!("courier_sub_outstanding_leases").set(state.leases.len() as f64);
        true
    }

    /// Collects the leases that need attention at `now`. Extended leases get
    /// their new deadline immediately so the next cycle does not repeat them.
    pub(crate) fn plan(&self, now: Instant, exactly_once: bool) -> ExtensionPlan {
        let mut state = self.state.lock();
        let extension = self.extension_locked(&state, exactly_once);
        let padding = self.settings.expiration_padding;
        let period = self.settings.max_extension_period;
        let mut plan = ExtensionPlan {
            extension_seconds: extension.as_secs() as u32,
            ..ExtensionPlan::default()
        };
        state.leases.retain(|ack_id, lease| {
            if lease.deadline.saturating_duration_since(now) > padding {
                return true;
            }
            let total_expiration = lease.received_at + period;
            if total_expiration > now + extension {
                lease.deadline = now + extension;
                plan.extend.push(ack_id.clone());
                return true;
            }
            if total_expiration > now {
                let remaining = total_expiration.duration_since(now).as_secs_f64().ceil() as u32;
                plan.final_modacks
                    .entry(remaining.max(1))
                    .or_default()
                    .push(ack_id.clone());
            }
            plan.forgotten += 1;
            false
        });
        if plan.forgotten > 0 {
            tracing::debug!(forgotten = plan.forgotten, "leases reached max extension period");
            metrics::counter!("courier_sub_leases_expired_total").increment(plan.forgotten as u64);
            metrics::gauge!("courier_sub_outstanding_leases").set(state.leases.len() as f64);
        }
        plan
    }

    /// Removes every lease and returns the ack ids, for the final nack on shutdown.
    pub(crate) fn drain(&self) -> Vec<String> {
        let mut state = self.state.lock();
        let ids = state.leases.drain().map(|(ack_id, _)| ack_id).collect();
        metrics::gauge!("courier_sub_outstanding_leases").set(0.0);
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().leases.len()
    }
}
