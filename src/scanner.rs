use std::sync::Arc;

use ethers::types::H256;
use thiserror::Error;

use crate::{
    checkpoint::CheckpointStore,
    decoder::EventDecoder,
    provider::{ChainQuery, ChainQueryError},
    types::{Cursor, EventSink, WatchTarget},
};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("could not get block number: {0}")]
    HeadBlock(#[source] ChainQueryError),
    #[error("could not get logs from block {from_block} to {to_block}: {source}")]
    FilterLogs {
        from_block: u64,
        to_block: u64,
        #[source]
        source: ChainQueryError,
    },
    #[error("could not get receipt for trigger transaction {tx_hash:?}: {source}")]
    TriggerReceipt {
        tx_hash: H256,
        #[source]
        source: ChainQueryError,
    },
    #[error("trigger transaction {0:?} reverted")]
    TriggerReverted(H256),
}

/// Whether a failed step can be retried as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::HeadBlock(_)
            | ScanError::FilterLogs { .. }
            | ScanError::TriggerReceipt { .. } => ErrorKind::Transient,
            ScanError::TriggerReverted(_) => ErrorKind::Permanent,
        }
    }
}

/// Where the cursor was seeded from at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedSource {
    Checkpoint,
    StartBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The head has not moved past the cursor.
    UpToDate { head: u64 },
    Scanned {
        from_block: u64,
        to_block: u64,
        events: usize,
    },
}

/// Advances one watch target's cursor over the chain, one range per tick.
pub struct Scanner {
    chain: Arc<dyn ChainQuery>,
    target: WatchTarget,
    decoder: EventDecoder,
    sink: Arc<dyn EventSink>,
    cursor: Cursor,
}

impl Scanner {
    pub fn new(
        chain: Arc<dyn ChainQuery>,
        target: WatchTarget,
        decoder: EventDecoder,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let cursor = Cursor::starting_at(target.start_block);
        Self {
            chain,
            target,
            decoder,
            sink,
            cursor,
        }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Seeds the cursor from the latest checkpoint for this contract, falling
    /// back to the configured start block when there is none or the lookup
    /// fails.
    pub async fn seed(&mut self, store: &dyn CheckpointStore) -> SeedSource {
        let contract = self.target.contract_address;
        match store.load_latest(contract).await {
            Ok(Some(record)) => {
                tracing::info!(
                    contract = ?contract,
                    last_checked_block = record.last_checked_block,
                    checkpointed_at = %record.timestamp,
                    "resuming from checkpoint"
                );
                self.cursor = Cursor::after(record.last_checked_block);
                SeedSource::Checkpoint
            }
            Ok(None) => {
                tracing::info!(
                    contract = ?contract,
                    start_block = self.target.start_block,
                    "no checkpoint found, starting from configured block"
                );
                self.cursor = Cursor::starting_at(self.target.start_block);
                SeedSource::StartBlock
            }
            Err(error) => {
                tracing::error!(
                    contract = ?contract,
                    start_block = self.target.start_block,
                    "could not load checkpoint, starting from configured block: {error}"
                );
                self.cursor = Cursor::starting_at(self.target.start_block);
                SeedSource::StartBlock
            }
        }
    }

    /// Decodes the logs this contract emitted in the transaction that
    /// started the watch. With neither a checkpoint nor a start block,
    /// scanning then resumes after that transaction's block. A configured
    /// start block is always scanned from, even if it lies before the
    /// trigger transaction.
    pub async fn check_trigger_transaction(
        &mut self,
        tx_hash: H256,
        seed: SeedSource,
    ) -> Result<usize, ScanError> {
        let receipt = self
            .chain
            .receipt_for(tx_hash)
            .await
            .map_err(|source| ScanError::TriggerReceipt { tx_hash, source })?;
        if !receipt.succeeded {
            return Err(ScanError::TriggerReverted(tx_hash));
        }
        tracing::info!(
            contract = ?self.target.contract_address,
            tx_hash = ?tx_hash,
            block = receipt.block_number,
            "trigger transaction confirmed"
        );

        let logs: Vec<_> = receipt
            .logs
            .into_iter()
            .filter(|log| log.address == self.target.contract_address)
            .collect();
        let records = self.decoder.decode_batch(&logs);
        let events = records.len();
        for record in records {
            tracing::debug!(event = record.event.name(), "dispatching trigger event");
            self.sink.dispatch(record).await;
        }

        if seed == SeedSource::StartBlock && self.target.start_block == 0 {
            if let Some(block) = receipt.block_number {
                self.cursor.advance_to(block);
            }
        }

        Ok(events)
    }

    /// Scans everything between the cursor and the current head. The cursor
    /// only moves once the whole range has been fetched, so a failed tick
    /// leaves it untouched and the next one retries the same range.
    pub async fn tick(&mut self) -> Result<TickOutcome, ScanError> {
        let contract = self.target.contract_address;
        let head = self.chain.head_block().await.map_err(ScanError::HeadBlock)?;

        let Some((from_block, to_block)) = self.cursor.pending_range(head) else {
            tracing::trace!(contract = ?contract, head, "no new blocks");
            return Ok(TickOutcome::UpToDate { head });
        };

        tracing::debug!(contract = ?contract, from_block, to_block, "scanning range");
        let logs = self
            .chain
            .filter_logs(
                contract,
                &self.target.topics,
                from_block,
                to_block,
            )
            .await
            .map_err(|source| ScanError::FilterLogs {
                from_block,
                to_block,
                source,
            })?;

        let records = self.decoder.decode_batch(&logs);
        let events = records.len();
        for record in records {
            tracing::debug!(
                contract = ?contract,
                event = record.event.name(),
                block = record.block_number,
                "dispatching event"
            );
            self.sink.dispatch(record).await;
        }

        self.cursor.advance_to(to_block);
        tracing::info!(
            contract = ?contract,
            from_block,
            to_block,
            logs = logs.len(),
            events,
            "range scanned"
        );

        Ok(TickOutcome::Scanned {
            from_block,
            to_block,
            events,
        })
    }
}
