use std::{future::Future, num::NonZeroU32, sync::Arc, time::Duration};

use async_trait::async_trait;
use ethers::{
    providers::{Http, Middleware, Provider, ProviderError},
    types::{Address, Filter, ValueOrArray, H256},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use url::Url;

use crate::{
    types::{RawLog, Receipt},
    watch_config::{RpcTimeouts, WatchConfig},
    Error,
};

#[derive(thiserror::Error, Debug)]
pub enum ChainQueryError {
    #[error("{call} timed out after {timeout:?}")]
    Timeout {
        call: &'static str,
        timeout: Duration,
    },
    #[error("{call} failed: {source}")]
    Provider {
        call: &'static str,
        #[source]
        source: ProviderError,
    },
    #[error("no receipt for transaction {0:?}")]
    ReceiptNotFound(H256),
}

/// The three chain primitives a watch session needs.
#[async_trait]
pub trait ChainQuery: Send + Sync {
    async fn head_block(&self) -> Result<u64, ChainQueryError>;

    /// Logs emitted by `address` whose first topic is one of `topics`, for the
    /// inclusive block range `from_block..=to_block`.
    async fn filter_logs(
        &self,
        address: Address,
        topics: &[H256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainQueryError>;

    async fn receipt_for(&self, tx_hash: H256) -> Result<Receipt, ChainQueryError>;
}

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// [`ChainQuery`] over a JSON-RPC endpoint, with a timeout on every call and
/// an optional requests-per-second cap.
pub struct EthersChain {
    provider: Arc<Provider<Http>>,
    timeouts: RpcTimeouts,
    rate_limiter: Option<DirectRateLimiter>,
}

impl EthersChain {
    pub fn new(provider: Arc<Provider<Http>>, timeouts: RpcTimeouts) -> Self {
        Self {
            provider,
            timeouts,
            rate_limiter: None,
        }
    }

    /// Uses the timeouts and rate limit configured for a watch session.
    pub fn with_config(provider: Arc<Provider<Http>>, config: &WatchConfig) -> Self {
        Self::new(provider, config.rpc_timeouts).max_rps(config.rpc_max_rps)
    }

    pub fn max_rps(mut self, max_rps: Option<NonZeroU32>) -> Self {
        self.rate_limiter = max_rps.map(|rps| RateLimiter::direct(Quota::per_second(rps)));
        self
    }

    async fn call<T, F>(
        &self,
        call: &'static str,
        timeout: Duration,
        future: F,
    ) -> Result<T, ChainQueryError>
    where
        T: Send,
        F: Future<Output = Result<T, ProviderError>> + Send,
    {
        // apply rate limiting if necessary
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.until_ready().await;
        }

        tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| ChainQueryError::Timeout { call, timeout })?
            .map_err(|source| ChainQueryError::Provider { call, source })
    }
}

#[async_trait]
impl ChainQuery for EthersChain {
    async fn head_block(&self) -> Result<u64, ChainQueryError> {
        let block_number = self
            .call(
                "eth_blockNumber",
                self.timeouts.head,
                self.provider.get_block_number(),
            )
            .await?
            .as_u64();
        tracing::debug!("latest block number: {block_number}");
        Ok(block_number)
    }

    async fn filter_logs(
        &self,
        address: Address,
        topics: &[H256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, ChainQueryError> {
        let mut filter = Filter::new()
            .address(address)
            .from_block(from_block)
            .to_block(to_block);
        if !topics.is_empty() {
            filter = filter.topic0(ValueOrArray::Array(topics.to_vec()));
        }

        tracing::debug!("fetching logs from block {from_block} to {to_block}");
        let logs = self
            .call("eth_getLogs", self.timeouts.logs, self.provider.get_logs(&filter))
            .await?;
        tracing::debug!("fetched {} logs", logs.len());

        Ok(logs.into_iter().map(RawLog::from).collect())
    }

    async fn receipt_for(&self, tx_hash: H256) -> Result<Receipt, ChainQueryError> {
        self.call(
            "eth_getTransactionReceipt",
            self.timeouts.receipt,
            self.provider.get_transaction_receipt(tx_hash),
        )
        .await?
        .map(Receipt::from)
        .ok_or(ChainQueryError::ReceiptNotFound(tx_hash))
    }
}

/// Connects to `url` and checks the endpoint serves `expected_chain_id`.
/// Every failure here is a configuration problem and is not retried.
pub async fn get_provider(
    url: &str,
    expected_chain_id: u64,
) -> Result<Arc<Provider<Http>>, Error> {
    let url = Url::parse(url).map_err(|source| Error::InvalidRpcUrl {
        url: url.to_owned(),
        source,
    })?;
    let provider = Arc::new(Provider::new(Http::new(url)));

    let chain_id_from_provider = provider
        .get_chainid()
        .await
        .map_err(|source| Error::ProviderChainId {
            chain_id: expected_chain_id,
            source,
        })?
        .as_u64();

    if chain_id_from_provider != expected_chain_id {
        Err(Error::ProviderChainIdMismatch {
            from_provider: chain_id_from_provider,
            expected: expected_chain_id,
        })
    } else {
        Ok(provider)
    }
}
