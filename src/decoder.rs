use std::collections::HashMap;

use ethers::{
    abi::{self, Event, EventParam, ParamType, Token},
    types::{Address, H256, U256},
};
use thiserror::Error;

use crate::types::{DecodedEvent, EventRecord, RawLog};

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("could not parse {event} payload: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: abi::Error,
    },
    #[error("{event} payload is missing parameter {param}")]
    MissingParam {
        event: &'static str,
        param: &'static str,
    },
}

/// The event kinds a watch session knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AssetIncepted,
    AssetConfirmed,
    Transfer,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::AssetIncepted,
        EventKind::AssetConfirmed,
        EventKind::Transfer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::AssetIncepted => "AssetIncepted",
            EventKind::AssetConfirmed => "AssetConfirmed",
            EventKind::Transfer => "Transfer",
        }
    }

    pub fn schema(&self) -> Event {
        let inputs = match self {
            EventKind::AssetIncepted => vec![
                param("Id", ParamType::Uint(256), false),
                param("assetIncepted", ParamType::Bool, false),
            ],
            EventKind::AssetConfirmed => vec![
                param("Id", ParamType::Uint(256), false),
                param("assetConfirmed", ParamType::Bool, false),
            ],
            EventKind::Transfer => vec![
                param("from", ParamType::Address, true),
                param("to", ParamType::Address, true),
                param("value", ParamType::Uint(256), false),
            ],
        };
        Event {
            name: self.name().to_owned(),
            inputs,
            anonymous: false,
        }
    }

    /// Keccak256 of the canonical signature, e.g. `AssetIncepted(uint256,bool)`.
    pub fn topic(&self) -> H256 {
        self.schema().signature()
    }

    fn build(&self, tokens: Vec<Token>) -> Result<DecodedEvent, DecodeError> {
        let event = self.name();
        let mut tokens = tokens.into_iter();
        let mut next = |param: &'static str| {
            tokens
                .next()
                .ok_or(DecodeError::MissingParam { event, param })
        };
        let decoded = match self {
            EventKind::AssetIncepted => DecodedEvent::AssetIncepted {
                id: uint(next("Id")?, event, "Id")?,
                incepted: boolean(next("assetIncepted")?, event, "assetIncepted")?,
            },
            EventKind::AssetConfirmed => DecodedEvent::AssetConfirmed {
                id: uint(next("Id")?, event, "Id")?,
                confirmed: boolean(next("assetConfirmed")?, event, "assetConfirmed")?,
            },
            EventKind::Transfer => DecodedEvent::Transfer {
                from: address(next("from")?, event, "from")?,
                to: address(next("to")?, event, "to")?,
                amount: uint(next("value")?, event, "value")?,
            },
        };
        Ok(decoded)
    }
}

fn param(name: &str, kind: ParamType, indexed: bool) -> EventParam {
    EventParam {
        name: name.to_owned(),
        kind,
        indexed,
    }
}

fn uint(token: Token, event: &'static str, param: &'static str) -> Result<U256, DecodeError> {
    token
        .into_uint()
        .ok_or(DecodeError::MissingParam { event, param })
}

fn boolean(token: Token, event: &'static str, param: &'static str) -> Result<bool, DecodeError> {
    token
        .into_bool()
        .ok_or(DecodeError::MissingParam { event, param })
}

fn address(token: Token, event: &'static str, param: &'static str) -> Result<Address, DecodeError> {
    token
        .into_address()
        .ok_or(DecodeError::MissingParam { event, param })
}

/// Maps a log's first topic to the event kind it signals and decodes the
/// payload. The topic table is fixed at construction.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    schemas: HashMap<H256, (EventKind, Event)>,
}

impl EventDecoder {
    pub fn new(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        let schemas = kinds
            .into_iter()
            .map(|kind| {
                let schema = kind.schema();
                (schema.signature(), (kind, schema))
            })
            .collect();
        Self { schemas }
    }

    /// Topic hashes to filter on, in a stable order.
    pub fn topics(&self) -> Vec<H256> {
        let mut topics: Vec<H256> = self.schemas.keys().copied().collect();
        topics.sort();
        topics
    }

    /// `Ok(None)` when the log's first topic is not one of ours.
    pub fn decode(&self, log: &RawLog) -> Result<Option<DecodedEvent>, DecodeError> {
        let Some((kind, schema)) = log.topics.first().and_then(|topic| self.schemas.get(topic))
        else {
            return Ok(None);
        };

        let parsed = schema
            .parse_log(abi::RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .map_err(|source| DecodeError::Payload {
                event: kind.name(),
                source,
            })?;

        kind.build(parsed.params.into_iter().map(|param| param.value).collect())
            .map(Some)
    }

    /// Decodes `logs` in the order given. Unknown topics and malformed
    /// payloads are logged and skipped; one bad log never stops the batch.
    pub fn decode_batch(&self, logs: &[RawLog]) -> Vec<EventRecord> {
        let mut records = Vec::with_capacity(logs.len());
        for log in logs {
            match self.decode(log) {
                Ok(Some(event)) => records.push(EventRecord {
                    contract_address: log.address,
                    block_number: log.block_number,
                    tx_hash: log.tx_hash,
                    event,
                }),
                Ok(None) => {
                    tracing::debug!(
                        block = log.block_number,
                        topic = ?log.topics.first(),
                        "skipping log with unknown event topic"
                    );
                }
                Err(error) => {
                    tracing::error!(
                        contract = ?log.address,
                        block = log.block_number,
                        tx_hash = ?log.tx_hash,
                        data = %log.data,
                        "could not decode log: {error}"
                    );
                }
            }
        }
        records
    }
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new(EventKind::ALL)
    }
}
