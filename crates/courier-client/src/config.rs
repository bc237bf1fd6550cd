// Publisher and subscriber settings with env and YAML overrides.
use anyhow::{Context, Result, bail};
use courier_common::StatusCode;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;

use crate::subscriber::{ShutdownMode, ShutdownSettings};

pub(crate) const DEFAULT_BATCH_MAX_ELEMENTS: usize = 100;
pub(crate) const DEFAULT_BATCH_MAX_BYTES: u64 = 1000;
pub(crate) const DEFAULT_BATCH_MAX_DELAY: Duration = Duration::from_millis(1);

/// Broker ceiling on messages per publish request.
pub const MAX_BATCH_ELEMENTS: usize = 1000;
/// Broker ceiling on bytes per publish request.
pub const MAX_BATCH_BYTES: u64 = 10 * 1024 * 1024;

pub(crate) const DEFAULT_SUB_MAX_OUTSTANDING_ELEMENTS: u64 = 1000;
pub(crate) const DEFAULT_SUB_MAX_OUTSTANDING_BYTES: u64 = 100 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_CONCURRENT_CALLBACKS: usize = 10;
pub(crate) const DEFAULT_PARALLEL_PULL_COUNT: usize = 1;

/// Bounds the broker accepts for a stream ack deadline.
pub const MIN_ACK_DEADLINE: Duration = Duration::from_secs(10);
pub const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);
pub(crate) const DEFAULT_STREAM_ACK_DEADLINE: Duration = Duration::from_secs(60);
/// Exactly-once subscriptions extend in larger steps so receipts stay valid.
pub(crate) const DEFAULT_EXACTLY_ONCE_MIN_EXTENSION: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_MAX_EXTENSION_PERIOD: Duration = Duration::from_secs(60 * 60);
/// Leases are extended this long before their deadline to absorb RPC latency.
pub(crate) const DEFAULT_EXPIRATION_PADDING: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_LEASE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) const DEFAULT_ACK_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// Broker ceiling on ack ids per acknowledge / modify-ack-deadline request.
pub const MAX_ACK_IDS_PER_REQUEST: usize = 1000;

pub(crate) const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(10);

/// What a flow controller does when a reservation does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitBehavior {
    /// Suspend the caller until capacity frees up.
    Block,
    /// Count usage but never refuse.
    Ignore,
    /// Fail the reservation immediately.
    ThrowException,
}

impl LimitBehavior {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "block" => Some(LimitBehavior::Block),
            "ignore" => Some(LimitBehavior::Ignore),
            "throw_exception" | "throw" => Some(LimitBehavior::ThrowException),
            _ => None,
        }
    }
}

/// Ceilings on outstanding work. A ceiling of zero disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlSettings {
    pub max_outstanding_elements: u64,
    pub max_outstanding_bytes: u64,
    pub limit_behavior: LimitBehavior,
}

impl FlowControlSettings {
    pub fn disabled() -> Self {
        Self {
            max_outstanding_elements: 0,
            max_outstanding_bytes: 0,
            limit_behavior: LimitBehavior::Ignore,
        }
    }

    pub fn blocking(max_outstanding_elements: u64, max_outstanding_bytes: u64) -> Self {
        Self {
            max_outstanding_elements,
            max_outstanding_bytes,
            limit_behavior: LimitBehavior::Block,
        }
    }
}

/// Thresholds that seal an open batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchingSettings {
    pub max_elements: usize,
    pub max_bytes: u64,
    pub max_delay: Duration,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            max_elements: DEFAULT_BATCH_MAX_ELEMENTS,
            max_bytes: DEFAULT_BATCH_MAX_BYTES,
            max_delay: DEFAULT_BATCH_MAX_DELAY,
        }
    }
}

impl BatchingSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_elements == 0 || self.max_elements > MAX_BATCH_ELEMENTS {
            bail!(
                "batch max_elements must be in 1..={MAX_BATCH_ELEMENTS}, got {}",
                self.max_elements
            );
        }
        if self.max_bytes == 0 || self.max_bytes > MAX_BATCH_BYTES {
            bail!(
                "batch max_bytes must be in 1..={MAX_BATCH_BYTES}, got {}",
                self.max_bytes
            );
        }
        if self.max_delay.is_zero() {
            bail!("batch max_delay must be positive");
        }
        Ok(())
    }
}

/// Retry policy for one RPC. The retryable set is data, not code.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub initial_retry_delay: Duration,
    pub retry_delay_multiplier: f64,
    pub max_retry_delay: Duration,
    pub initial_rpc_timeout: Duration,
    pub rpc_timeout_multiplier: f64,
    pub max_rpc_timeout: Duration,
    /// Budget spanning every attempt and every backoff sleep.
    pub total_timeout: Duration,
    pub retryable_codes: BTreeSet<StatusCode>,
}

impl RetrySettings {
    /// Defaults for the publish RPC.
    pub fn publish_defaults() -> Self {
        Self {
            initial_retry_delay: Duration::from_millis(100),
            retry_delay_multiplier: 4.0,
            max_retry_delay: Duration::from_secs(60),
            initial_rpc_timeout: Duration::from_secs(5),
            rpc_timeout_multiplier: 4.0,
            max_rpc_timeout: Duration::from_secs(60),
            total_timeout: Duration::from_secs(600),
            retryable_codes: [
                StatusCode::Aborted,
                StatusCode::Cancelled,
                StatusCode::DeadlineExceeded,
                StatusCode::Internal,
                StatusCode::ResourceExhausted,
                StatusCode::Unknown,
                StatusCode::Unavailable,
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn is_retryable(&self, code: StatusCode) -> bool {
        self.retryable_codes.contains(&code)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_delay_multiplier < 1.0 || self.rpc_timeout_multiplier < 1.0 {
            bail!("retry multipliers must be >= 1.0");
        }
        if self.total_timeout.is_zero() || self.initial_rpc_timeout.is_zero() {
            bail!("retry timeouts must be positive");
        }
        Ok(())
    }
}

/// Exponential backoff without an overall budget, used for stream reconnects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSettings {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial: DEFAULT_RECONNECT_INITIAL,
            multiplier: 2.0,
            max: DEFAULT_RECONNECT_MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub batching: BatchingSettings,
    pub flow_control: FlowControlSettings,
    pub retry: RetrySettings,
    pub enable_message_ordering: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batching: BatchingSettings::default(),
            flow_control: FlowControlSettings::disabled(),
            retry: RetrySettings::publish_defaults(),
            enable_message_ordering: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct PublisherConfigOverride {
    batch_max_elements: Option<usize>,
    batch_max_bytes: Option<u64>,
    batch_max_delay_ms: Option<u64>,
    flow_max_outstanding_elements: Option<u64>,
    flow_max_outstanding_bytes: Option<u64>,
    flow_limit_behavior: Option<LimitBehavior>,
    retry_initial_delay_ms: Option<u64>,
    retry_delay_multiplier: Option<f64>,
    retry_max_delay_ms: Option<u64>,
    retry_initial_rpc_timeout_ms: Option<u64>,
    retry_rpc_timeout_multiplier: Option<f64>,
    retry_max_rpc_timeout_ms: Option<u64>,
    retry_total_timeout_ms: Option<u64>,
    retryable_codes: Option<Vec<StatusCode>>,
    enable_message_ordering: Option<bool>,
}

impl PublisherConfig {
    /// Defaults, then `COURIER_PUB_*` env vars, then the YAML file at `config_path`
    /// or `COURIER_PUBLISHER_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(contents) = read_override(config_path, "COURIER_PUBLISHER_CONFIG")? {
            let override_cfg: PublisherConfigOverride =
                serde_yaml::from_str(&contents).context("parse publisher config yaml")?;
            override_cfg.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize_env("COURIER_PUB_BATCH_MAX_ELEMENTS") {
            config.batching.max_elements = value;
        }
        if let Some(value) = read_u64_env("COURIER_PUB_BATCH_MAX_BYTES") {
            config.batching.max_bytes = value;
        }
        if let Some(value) = read_millis_env("COURIER_PUB_BATCH_MAX_DELAY_MS") {
            config.batching.max_delay = value;
        }
        if let Some(value) = read_limit_env("COURIER_PUB_FLOW_MAX_OUTSTANDING_ELEMENTS") {
            config.flow_control.max_outstanding_elements = value;
        }
        if let Some(value) = read_limit_env("COURIER_PUB_FLOW_MAX_OUTSTANDING_BYTES") {
            config.flow_control.max_outstanding_bytes = value;
        }
        if let Some(value) = std::env::var("COURIER_PUB_FLOW_LIMIT_BEHAVIOR")
            .ok()
            .and_then(|value| LimitBehavior::parse(&value))
        {
            config.flow_control.limit_behavior = value;
        }
        if let Some(value) = read_millis_env("COURIER_PUB_RETRY_TOTAL_TIMEOUT_MS") {
            config.retry.total_timeout = value;
        }
        if let Some(value) = read_codes_env("COURIER_PUB_RETRYABLE_CODES") {
            config.retry.retryable_codes = value;
        }
        if let Some(value) = read_bool_env("COURIER_PUB_ENABLE_ORDERING") {
            config.enable_message_ordering = value;
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        self.batching.validate()?;
        self.retry.validate()
    }
}

impl PublisherConfigOverride {
    fn apply(&self, config: &mut PublisherConfig) {
        if let Some(value) = self.batch_max_elements
            && value > 0
        {
            config.batching.max_elements = value;
        }
        if let Some(value) = self.batch_max_bytes
            && value > 0
        {
            config.batching.max_bytes = value;
        }
        if let Some(value) = self.batch_max_delay_ms
            && value > 0
        {
            config.batching.max_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.flow_max_outstanding_elements {
            config.flow_control.max_outstanding_elements = value;
        }
        if let Some(value) = self.flow_max_outstanding_bytes {
            config.flow_control.max_outstanding_bytes = value;
        }
        if let Some(value) = self.flow_limit_behavior {
            config.flow_control.limit_behavior = value;
        }
        let retry = &mut config.retry;
        if let Some(value) = self.retry_initial_delay_ms
            && value > 0
        {
            retry.initial_retry_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_delay_multiplier
            && value >= 1.0
        {
            retry.retry_delay_multiplier = value;
        }
        if let Some(value) = self.retry_max_delay_ms
            && value > 0
        {
            retry.max_retry_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_initial_rpc_timeout_ms
            && value > 0
        {
            retry.initial_rpc_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_rpc_timeout_multiplier
            && value >= 1.0
        {
            retry.rpc_timeout_multiplier = value;
        }
        if let Some(value) = self.retry_max_rpc_timeout_ms
            && value > 0
        {
            retry.max_rpc_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_total_timeout_ms
            && value > 0
        {
            retry.total_timeout = Duration::from_millis(value);
        }
        if let Some(codes) = &self.retryable_codes {
            retry.retryable_codes = codes.iter().copied().collect();
        }
        if let Some(value) = self.enable_message_ordering {
            config.enable_message_ordering = value;
        }
    }
}

/// Lease timing. Zero per-extension bounds fall back to the broker limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    /// Deadline requested when the stream opens and used for receipt modacks.
    pub initial_deadline: Duration,
    /// Floor for a single extension.
    pub min_extension_period: Duration,
    /// Ceiling for a single extension.
    pub max_duration_per_extension: Duration,
    /// Extension stops this long after receipt. Zero never extends past the receipt modack.
    pub max_extension_period: Duration,
    pub expiration_padding: Duration,
    pub check_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            initial_deadline: DEFAULT_STREAM_ACK_DEADLINE,
            min_extension_period: Duration::ZERO,
            max_duration_per_extension: Duration::ZERO,
            max_extension_period: DEFAULT_MAX_EXTENSION_PERIOD,
            expiration_padding: DEFAULT_EXPIRATION_PADDING,
            check_interval: DEFAULT_LEASE_CHECK_INTERVAL,
        }
    }
}

impl LeaseSettings {
    pub(crate) fn stream_ack_deadline(&self) -> Duration {
        self.initial_deadline.clamp(MIN_ACK_DEADLINE, MAX_ACK_DEADLINE)
    }

    pub(crate) fn min_extension(&self, exactly_once: bool) -> Duration {
        if !self.min_extension_period.is_zero() {
            self.min_extension_period.clamp(MIN_ACK_DEADLINE, MAX_ACK_DEADLINE)
        } else if exactly_once {
            DEFAULT_EXACTLY_ONCE_MIN_EXTENSION
        } else {
            MIN_ACK_DEADLINE
        }
    }

    pub(crate) fn max_per_extension(&self) -> Duration {
        if self.max_duration_per_extension.is_zero() {
            MAX_ACK_DEADLINE
        } else {
            self.max_duration_per_extension.clamp(MIN_ACK_DEADLINE, MAX_ACK_DEADLINE)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberConfig {
    pub flow_control: FlowControlSettings,
    pub lease: LeaseSettings,
    pub max_concurrent_callbacks: usize,
    pub parallel_pull_count: usize,
    pub enable_exactly_once_delivery: bool,
    pub ack_flush_interval: Duration,
    pub max_ack_ids_per_request: usize,
    pub reconnect_backoff: BackoffSettings,
    /// Applied to acknowledge / modify-ack-deadline calls.
    pub ack_retry: RetrySettings,
    pub shutdown: ShutdownSettings,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            flow_control: FlowControlSettings::blocking(
                DEFAULT_SUB_MAX_OUTSTANDING_ELEMENTS,
                DEFAULT_SUB_MAX_OUTSTANDING_BYTES,
            ),
            lease: LeaseSettings::default(),
            max_concurrent_callbacks: DEFAULT_MAX_CONCURRENT_CALLBACKS,
            parallel_pull_count: DEFAULT_PARALLEL_PULL_COUNT,
            enable_exactly_once_delivery: false,
            ack_flush_interval: DEFAULT_ACK_FLUSH_INTERVAL,
            max_ack_ids_per_request: MAX_ACK_IDS_PER_REQUEST,
            reconnect_backoff: BackoffSettings::default(),
            ack_retry: RetrySettings {
                total_timeout: Duration::from_secs(600),
                ..RetrySettings::publish_defaults()
            },
            shutdown: ShutdownSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct SubscriberConfigOverride {
    max_outstanding_elements: Option<u64>,
    max_outstanding_bytes: Option<u64>,
    ack_deadline_ms: Option<u64>,
    min_extension_period_ms: Option<u64>,
    max_duration_per_extension_ms: Option<u64>,
    max_extension_period_ms: Option<u64>,
    max_concurrent_callbacks: Option<usize>,
    parallel_pull_count: Option<usize>,
    enable_exactly_once_delivery: Option<bool>,
    ack_flush_interval_ms: Option<u64>,
    shutdown_mode: Option<ShutdownMode>,
    shutdown_timeout_ms: Option<u64>,
}

impl SubscriberConfig {
    /// Defaults, then `COURIER_SUB_*` env vars, then the YAML file at `config_path`
    /// or `COURIER_SUBSCRIBER_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(contents) = read_override(config_path, "COURIER_SUBSCRIBER_CONFIG")? {
            let override_cfg: SubscriberConfigOverride =
                serde_yaml::from_str(&contents).context("parse subscriber config yaml")?;
            override_cfg.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_limit_env("COURIER_SUB_MAX_OUTSTANDING_ELEMENTS") {
            config.flow_control.max_outstanding_elements = value;
        }
        if let Some(value) = read_limit_env("COURIER_SUB_MAX_OUTSTANDING_BYTES") {
            config.flow_control.max_outstanding_bytes = value;
        }
        if let Some(value) = read_millis_env("COURIER_SUB_ACK_DEADLINE_MS") {
            config.lease.initial_deadline = value;
        }
        if let Some(value) = read_millis_env("COURIER_SUB_MAX_EXTENSION_PERIOD_MS") {
            config.lease.max_extension_period = value;
        }
        if let Some(value) = read_usize_env("COURIER_SUB_MAX_CONCURRENT_CALLBACKS") {
            config.max_concurrent_callbacks = value;
        }
        if let Some(value) = read_usize_env("COURIER_SUB_PARALLEL_PULL_COUNT") {
            config.parallel_pull_count = value;
        }
        if let Some(value) = read_bool_env("COURIER_SUB_EXACTLY_ONCE") {
            config.enable_exactly_once_delivery = value;
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_callbacks == 0 {
            bail!("max_concurrent_callbacks must be positive");
        }
        if self.parallel_pull_count == 0 {
            bail!("parallel_pull_count must be positive");
        }
        if self.max_ack_ids_per_request == 0 || self.max_ack_ids_per_request > MAX_ACK_IDS_PER_REQUEST
        {
            bail!("max_ack_ids_per_request must be in 1..={MAX_ACK_IDS_PER_REQUEST}");
        }
        if self.ack_flush_interval.is_zero() || self.lease.check_interval.is_zero() {
            bail!("ack flush and lease check intervals must be positive");
        }
        self.ack_retry.validate()
    }
}

impl SubscriberConfigOverride {
    fn apply(&self, config: &mut SubscriberConfig) {
        if let Some(value) = self.max_outstanding_elements {
            config.flow_control.max_outstanding_elements = value;
        }
        if let Some(value) = self.max_outstanding_bytes {
            config.flow_control.max_outstanding_bytes = value;
        }
        if let Some(value) = self.ack_deadline_ms
            && value > 0
        {
            config.lease.initial_deadline = Duration::from_millis(value);
        }
        if let Some(value) = self.min_extension_period_ms {
            config.lease.min_extension_period = Duration::from_millis(value);
        }
        if let Some(value) = self.max_duration_per_extension_ms {
            config.lease.max_duration_per_extension = Duration::from_millis(value);
        }
        if let Some(value) = self.max_extension_period_ms {
            config.lease.max_extension_period = Duration::from_millis(value);
        }
        if let Some(value) = self.max_concurrent_callbacks
            && value > 0
        {
            config.max_concurrent_callbacks = value;
        }
        if let Some(value) = self.parallel_pull_count
            && value > 0
        {
            config.parallel_pull_count = value;
        }
        if let Some(value) = self.enable_exactly_once_delivery {
            config.enable_exactly_once_delivery = value;
        }
        if let Some(value) = self.ack_flush_interval_ms
            && value > 0
        {
            config.ack_flush_interval = Duration::from_millis(value);
        }
        if let Some(mode) = self.shutdown_mode {
            config.shutdown.mode = mode;
        }
        if let Some(value) = self.shutdown_timeout_ms {
            config.shutdown.timeout = (value > 0).then(|| Duration::from_millis(value));
        }
    }
}

fn read_override(config_path: Option<&str>, env_key: &str) -> Result<Option<String>> {
    let override_path = config_path
        .map(|value| value.to_string())
        .or_else(|| std::env::var(env_key).ok());
    match override_path.as_deref() {
        Some(path) => fs::read_to_string(path)
            .map(Some)
            .with_context(|| format!("read config: {path}")),
        None => Ok(None),
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

// Zero is meaningful for flow-control ceilings (it disables the check).
fn read_limit_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_millis_env(key: &str) -> Option<Duration> {
    read_u64_env(key).map(Duration::from_millis)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

fn read_codes_env(key: &str) -> Option<BTreeSet<StatusCode>> {
    let value = std::env::var(key).ok()?;
    let codes = value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.parse::<StatusCode>())
        .collect::<std::result::Result<BTreeSet<_>, _>>();
    match codes {
        Ok(codes) => Some(codes),
        Err(err) => {
            tracing::warn!(error = %err, key, "ignoring invalid retryable codes");
            None
        }
    }
}
