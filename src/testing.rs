//! Scripted collaborators shared by the unit tests.

use std::{
    collections::VecDeque,
    io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use ethers::{
    abi::{self, Token},
    types::{Address, Bytes, H160, H256, U256},
};

use crate::{
    checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore},
    decoder::EventKind,
    provider::{ChainQuery, ChainQueryError},
    types::{EventRecord, EventSink, RawLog, Receipt},
};

/// A chain whose head follows a script. Once the script runs out the last
/// head is repeated; with no head at all, head queries fail.
#[derive(Default)]
pub(crate) struct FakeChain {
    heads: Mutex<VecDeque<u64>>,
    last_head: Mutex<Option<u64>>,
    logs: Mutex<Vec<RawLog>>,
    ranges: Mutex<Vec<(u64, u64)>>,
    failing_filters: Mutex<usize>,
    filter_delay: Mutex<Option<Duration>>,
    receipt: Mutex<Option<Receipt>>,
}

impl FakeChain {
    pub(crate) const CONTRACT: Address = H160([0xaa; 20]);

    pub(crate) fn with_heads(heads: impl IntoIterator<Item = u64>) -> Self {
        Self {
            heads: Mutex::new(heads.into_iter().collect()),
            ..Default::default()
        }
    }

    pub(crate) fn push_head(&self, head: u64) {
        self.heads.lock().unwrap().push_back(head);
    }

    pub(crate) fn push_log(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub(crate) fn fail_next_filters(&self, count: usize) {
        *self.failing_filters.lock().unwrap() = count;
    }

    pub(crate) fn delay_filters(&self, delay: Duration) {
        *self.filter_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn set_receipt(&self, receipt: Receipt) {
        *self.receipt.lock().unwrap() = Some(receipt);
    }

    /// Every range passed to `filter_logs`, failed calls included.
    pub(crate) fn ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap().clone()
    }

    pub(crate) fn log_at(block: u64, topics: Vec<H256>, data: Vec<u8>) -> RawLog {
        RawLog {
            address: Self::CONTRACT,
            block_number: Some(block),
            tx_hash: Some(H256::random()),
            topics,
            data: Bytes::from(data),
        }
    }
}

pub(crate) fn asset_log(block: u64, kind: EventKind, id: u64) -> RawLog {
    FakeChain::log_at(
        block,
        vec![kind.topic()],
        abi::encode(&[Token::Uint(U256::from(id)), Token::Bool(true)]),
    )
}

fn unavailable(call: &'static str) -> ChainQueryError {
    ChainQueryError::Timeout {
        call,
        timeout: Duration::from_secs(30),
    }
}

#[async_trait]
impl ChainQuery for FakeChain {
    async fn head_block(&self) -> Result<u64, ChainQueryError> {
        let next = self.heads.lock().unwrap().pop_front();
        let mut last_head = self.last_head.lock().unwrap();
        if let Some(head) = next {
            *last_head = Some(head);
        }
        last_head.ok_or_else(|| unavailable("eth_blockNumber"))
    }

    async fn filter_logs(
        &self,
        address: Address,
        _topics: &[H256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainQueryError> {
        self.ranges.lock().unwrap().push((from_block, to_block));

        let delay = *self.filter_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failing = self.failing_filters.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(unavailable("eth_getLogs"));
            }
        }

        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.address == address)
            .filter(|log| {
                log.block_number
                    .map_or(false, |block| (from_block..=to_block).contains(&block))
            })
            .cloned()
            .collect())
    }

    async fn receipt_for(&self, tx_hash: H256) -> Result<Receipt, ChainQueryError> {
        self.receipt
            .lock()
            .unwrap()
            .clone()
            .ok_or(ChainQueryError::ReceiptNotFound(tx_hash))
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    records: Mutex<Vec<EventRecord>>,
    stopped: Mutex<Vec<Address>>,
}

impl RecordingSink {
    pub(crate) fn records(&self) -> Vec<EventRecord> {
        self.records.lock().unwrap().clone()
    }

    pub(crate) fn stopped(&self) -> Vec<Address> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn dispatch(&self, record: EventRecord) {
        self.records.lock().unwrap().push(record);
    }

    async fn on_stopped(&self, contract_address: Address) {
        self.stopped.lock().unwrap().push(contract_address);
    }
}

/// A checkpoint store that is always down.
pub(crate) struct FailingStore;

#[async_trait]
impl CheckpointStore for FailingStore {
    async fn save(&self, _record: &CheckpointRecord) -> Result<(), CheckpointError> {
        Err(CheckpointError::Io {
            path: PathBuf::from("unavailable"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "store down"),
        })
    }

    async fn load_latest(
        &self,
        _contract_address: Address,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Err(CheckpointError::Io {
            path: PathBuf::from("unavailable"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "store down"),
        })
    }
}

/// Formatted log output collected while its guard is installed.
#[derive(Clone, Default)]
pub(crate) struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Routes every event on the current thread into this capture until the
    /// guard is dropped.
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
