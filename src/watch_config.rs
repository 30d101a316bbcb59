use std::{num::NonZeroU32, time::Duration};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use ethers::types::{Address, H256};

use crate::decoder::{EventDecoder, EventKind};

pub const DEFAULT_HEAD_POLLING_INTERVAL_SECONDS: u64 = 15;
pub const DEFAULT_FLUSH_INTERVAL_SECONDS: u64 = 5 * 60;
pub const DEFAULT_HEAD_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_LOGS_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_RECEIPT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_RETRY_INITIAL_INTERVAL_SECONDS: u64 = 1;
pub const DEFAULT_RETRY_MAX_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// Per-call deadlines for the chain primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcTimeouts {
    pub head: Duration,
    pub logs: Duration,
    pub receipt: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            head: Duration::from_secs(DEFAULT_HEAD_TIMEOUT_SECONDS),
            logs: Duration::from_secs(DEFAULT_LOGS_TIMEOUT_SECONDS),
            receipt: Duration::from_secs(DEFAULT_RECEIPT_TIMEOUT_SECONDS),
        }
    }
}

/// Backoff applied between failed ticks. Attempts are unbounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(DEFAULT_RETRY_INITIAL_INTERVAL_SECONDS),
            max_interval: Duration::from_secs(DEFAULT_RETRY_MAX_INTERVAL_SECONDS),
            multiplier: DEFAULT_RETRY_MULTIPLIER,
        }
    }
}

pub struct WatchConfig {
    pub contract_address: Address,
    pub start_block: u64,
    pub decoder: EventDecoder,
    pub trigger_tx: Option<H256>,
    pub head_polling_interval: Duration,
    pub flush_interval: Duration,
    pub rpc_timeouts: RpcTimeouts,
    pub rpc_max_rps: Option<NonZeroU32>,
    pub retry_policy: RetryPolicy,
}

impl WatchConfig {
    pub fn builder(contract_address: Address, start_block: u64) -> WatchConfigBuilder {
        WatchConfigBuilder::new(contract_address, start_block)
    }
}

pub struct WatchConfigBuilder {
    contract_address: Address,
    start_block: u64,
    event_kinds: Option<Vec<EventKind>>,
    trigger_tx: Option<H256>,
    head_polling_interval: Option<Duration>,
    flush_interval: Option<Duration>,
    rpc_timeouts: Option<RpcTimeouts>,
    rpc_max_rps: Option<NonZeroU32>,
    retry_policy: Option<RetryPolicy>,
}

impl WatchConfigBuilder {
    pub fn new(contract_address: Address, start_block: u64) -> Self {
        Self {
            contract_address,
            start_block,
            event_kinds: None,
            trigger_tx: None,
            head_polling_interval: None,
            flush_interval: None,
            rpc_timeouts: None,
            rpc_max_rps: None,
            retry_policy: None,
        }
    }

    pub fn build(self) -> WatchConfig {
        WatchConfig {
            contract_address: self.contract_address,
            start_block: self.start_block,
            decoder: match self.event_kinds {
                Some(kinds) => EventDecoder::new(kinds),
                None => EventDecoder::default(),
            },
            trigger_tx: self.trigger_tx,
            head_polling_interval: self
                .head_polling_interval
                .unwrap_or(Duration::from_secs(DEFAULT_HEAD_POLLING_INTERVAL_SECONDS)),
            flush_interval: self
                .flush_interval
                .unwrap_or(Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECONDS)),
            rpc_timeouts: self.rpc_timeouts.unwrap_or_default(),
            rpc_max_rps: self.rpc_max_rps,
            retry_policy: self.retry_policy.unwrap_or_default(),
        }
    }

    pub fn event_kinds(mut self, event_kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.event_kinds = Some(event_kinds.into_iter().collect());
        self
    }

    /// The transaction that started this watch. Its receipt logs are decoded
    /// once before scanning begins.
    pub fn trigger_tx(mut self, trigger_tx: Option<H256>) -> Self {
        self.trigger_tx = trigger_tx;
        self
    }

    pub fn head_polling_interval(mut self, head_polling_interval: Duration) -> Self {
        self.head_polling_interval = Some(head_polling_interval);
        self
    }

    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = Some(flush_interval);
        self
    }

    pub fn rpc_timeouts(mut self, rpc_timeouts: RpcTimeouts) -> Self {
        self.rpc_timeouts = Some(rpc_timeouts);
        self
    }

    pub fn rpc_max_rps(mut self, rpc_max_rps: Option<NonZeroU32>) -> Self {
        self.rpc_max_rps = rpc_max_rps;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }
}
