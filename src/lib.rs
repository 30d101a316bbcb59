pub mod checkpoint;
pub mod decoder;
pub mod provider;
pub mod scanner;
pub mod session;
pub mod types;
pub mod watch_config;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use ethers::{providers::ProviderError, types::Address};
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing_futures::Instrument;

use crate::{
    checkpoint::CheckpointStore,
    provider::ChainQuery,
    scanner::ScanError,
    session::{Session, StopHandle},
    types::EventSink,
    watch_config::WatchConfig,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid rpc url {url}: {source}")]
    InvalidRpcUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("chain id mismatch, provider gave {from_provider} while {expected} was expected")]
    ProviderChainIdMismatch { from_provider: u64, expected: u64 },
    #[error("could not get remote chain id from provider for chain {chain_id}: {source:?}")]
    ProviderChainId {
        chain_id: u64,
        #[source]
        source: ProviderError,
    },
    #[error("watch session for {contract_address:?} failed: {source}")]
    Session {
        contract_address: Address,
        #[source]
        source: ScanError,
    },
    #[error("error joining watch session tasks: {0:?}")]
    SessionsJoin(#[source] JoinError),
}

/// Runs one independent session per watched contract.
pub struct Watcher {
    sessions: Vec<(Session, StopHandle)>,
}

impl Watcher {
    pub fn builder(
        store: Arc<dyn CheckpointStore>,
        sink: Arc<dyn EventSink>,
    ) -> WatcherBuilder {
        WatcherBuilder::new(store, sink)
    }

    /// Handles that stop the sessions, in the order they were added.
    pub fn stop_handles(&self) -> Vec<StopHandle> {
        self.sessions
            .iter()
            .map(|(_, handle)| handle.clone())
            .collect()
    }

    /// Runs every session until all of them stop. The first session to fail
    /// permanently ends the whole watcher.
    pub async fn scan(self) -> Result<(), Error> {
        let mut join_set = JoinSet::new();
        for (session, _) in self.sessions.into_iter() {
            let contract = session.target().contract_address;
            tracing::info!("setting up watch session for contract {contract:?}");
            join_set.spawn(
                session
                    .run()
                    .instrument(tracing::info_span!("watch-session", contract = ?contract)),
            );
        }

        // wait until every session stops, or one fails
        while let Some(join_result) = join_set.join_next().await {
            match join_result {
                Ok(result) => {
                    if let Err(error) = result {
                        return Err(error);
                    }
                }
                Err(err) => {
                    return Err(Error::SessionsJoin(err));
                }
            }
        }

        Ok(())
    }
}

pub struct WatcherBuilder {
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn EventSink>,
    sessions: Vec<(Session, StopHandle)>,
}

impl WatcherBuilder {
    pub fn new(store: Arc<dyn CheckpointStore>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            sink,
            sessions: vec![],
        }
    }

    pub fn build(self) -> Watcher {
        Watcher {
            sessions: self.sessions,
        }
    }

    pub fn watch(mut self, config: WatchConfig, chain: Arc<dyn ChainQuery>) -> Self {
        self.sessions.push(Session::new(
            config,
            chain,
            self.store.clone(),
            self.sink.clone(),
        ));
        self
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use ethers::types::{Address, H256};

    use super::{Error, Watcher};
    use crate::{
        checkpoint::{CheckpointStore, MemoryStore},
        scanner::ScanError,
        testing::{FakeChain, RecordingSink},
        types::Receipt,
        watch_config::WatchConfig,
    };

    #[tokio::test(start_paused = true)]
    async fn sessions_run_independently_until_stopped() {
        let first = Arc::new(FakeChain::with_heads([10]));
        let second = Arc::new(FakeChain::with_heads([500]));
        let other_contract = Address::random();
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());

        let watcher = Watcher::builder(store.clone(), sink.clone())
            .watch(WatchConfig::builder(FakeChain::CONTRACT, 5).build(), first.clone())
            .watch(WatchConfig::builder(other_contract, 400).build(), second.clone())
            .build();
        let stop_handles = watcher.stop_handles();

        let running = tokio::spawn(watcher.scan());
        tokio::time::sleep(Duration::from_secs(1)).await;
        for handle in &stop_handles {
            handle.stop();
        }
        running.await.unwrap().unwrap();

        assert_eq!(first.ranges(), vec![(5, 10)]);
        assert_eq!(second.ranges(), vec![(400, 500)]);
        let first_checkpoint = store.load_latest(FakeChain::CONTRACT).await.unwrap();
        let second_checkpoint = store.load_latest(other_contract).await.unwrap();
        assert_eq!(first_checkpoint.unwrap().last_checked_block, 10);
        assert_eq!(second_checkpoint.unwrap().last_checked_block, 500);
        assert_eq!(sink.stopped().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_session_failure_ends_the_watcher() {
        let chain = Arc::new(FakeChain::with_heads([10]));
        let tx_hash = H256::random();
        chain.set_receipt(Receipt {
            tx_hash,
            block_number: Some(3),
            succeeded: false,
            logs: vec![],
        });
        let watcher = Watcher::builder(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingSink::default()),
        )
        .watch(
            WatchConfig::builder(FakeChain::CONTRACT, 0)
                .trigger_tx(Some(tx_hash))
                .build(),
            chain,
        )
        .build();

        let error = watcher.scan().await.unwrap_err();

        assert!(matches!(
            error,
            Error::Session {
                source: ScanError::TriggerReverted(_),
                ..
            }
        ));
    }
}
