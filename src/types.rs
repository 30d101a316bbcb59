use async_trait::async_trait;
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256};

/// A contract and the set of event topics being watched on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub contract_address: Address,
    pub topics: Vec<H256>,
    pub start_block: u64,
}

/// Highest block fully scanned for a watch target. `None` means nothing has
/// been scanned yet, so the next range starts at block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    last_scanned_block: Option<u64>,
}

impl Cursor {
    /// A cursor whose first range includes `start_block` itself.
    pub fn starting_at(start_block: u64) -> Self {
        Self {
            last_scanned_block: start_block.checked_sub(1),
        }
    }

    /// A cursor resuming after `block`, e.g. from a checkpoint.
    pub fn after(block: u64) -> Self {
        Self {
            last_scanned_block: Some(block),
        }
    }

    pub fn last_scanned_block(&self) -> Option<u64> {
        self.last_scanned_block
    }

    pub fn next_block(&self) -> u64 {
        self.last_scanned_block.map_or(0, |block| block + 1)
    }

    /// Returns the inclusive range still to be scanned up to `head`, if any.
    pub fn pending_range(&self, head: u64) -> Option<(u64, u64)> {
        match self.last_scanned_block {
            Some(last) if head <= last => None,
            _ => Some((self.next_block(), head)),
        }
    }

    /// Moves the cursor forward to `block`. Never moves backwards.
    pub fn advance_to(&mut self, block: u64) {
        if self.last_scanned_block.map_or(true, |last| block > last) {
            self.last_scanned_block = Some(block);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawLog {
    pub address: Address,
    pub block_number: Option<u64>,
    pub tx_hash: Option<H256>,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

impl From<Log> for RawLog {
    fn from(log: Log) -> Self {
        Self {
            address: log.address,
            block_number: log.block_number.map(|number| number.as_u64()),
            tx_hash: log.transaction_hash,
            topics: log.topics,
            data: log.data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    /// `false` when the transaction reverted.
    pub succeeded: bool,
    pub logs: Vec<RawLog>,
}

impl From<TransactionReceipt> for Receipt {
    fn from(receipt: TransactionReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|number| number.as_u64()),
            succeeded: receipt.status.map_or(true, |status| status.as_u64() != 0),
            logs: receipt.logs.into_iter().map(RawLog::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    AssetIncepted { id: U256, incepted: bool },
    AssetConfirmed { id: U256, confirmed: bool },
    Transfer { from: Address, to: Address, amount: U256 },
}

impl DecodedEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DecodedEvent::AssetIncepted { .. } => "AssetIncepted",
            DecodedEvent::AssetConfirmed { .. } => "AssetConfirmed",
            DecodedEvent::Transfer { .. } => "Transfer",
        }
    }
}

/// A decoded event together with where it was found on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub contract_address: Address,
    pub block_number: Option<u64>,
    pub tx_hash: Option<H256>,
    pub event: DecodedEvent,
}

/// Downstream consumer of decoded events. Delivery is at-least-once: a
/// range that failed mid-way is scanned again in full, so implementations
/// must tolerate seeing the same event twice.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, record: EventRecord);

    /// Best-effort notification that the session watching `contract_address`
    /// has stopped.
    async fn on_stopped(&self, _contract_address: Address) {}
}

/// Surfaces every event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn dispatch(&self, record: EventRecord) {
        let contract = record.contract_address;
        let tx_hash = record.tx_hash;
        match &record.event {
            DecodedEvent::AssetIncepted { id, incepted } => tracing::info!(
                contract = ?contract,
                block = record.block_number,
                tx_hash = ?tx_hash,
                event = "AssetIncepted",
                %id,
                incepted,
                "asset incepted"
            ),
            DecodedEvent::AssetConfirmed { id, confirmed } => tracing::info!(
                contract = ?contract,
                block = record.block_number,
                tx_hash = ?tx_hash,
                event = "AssetConfirmed",
                %id,
                confirmed,
                "asset confirmed"
            ),
            DecodedEvent::Transfer { from, to, amount } => tracing::info!(
                contract = ?contract,
                block = record.block_number,
                tx_hash = ?tx_hash,
                event = "Transfer",
                from = ?from,
                to = ?to,
                %amount,
                "transfer"
            ),
        }
    }

    async fn on_stopped(&self, contract_address: Address) {
        tracing::info!(contract = ?contract_address, "stopped watching contract");
    }
}
