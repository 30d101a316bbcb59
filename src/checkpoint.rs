use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

pub const DEFAULT_CHECKPOINT_DIR: &str = "contract_data";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encode checkpoint for {contract_address:?}: {source}")]
    Encode {
        contract_address: Address,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable snapshot of a watch session's cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub contract_address: Address,
    pub last_checked_block: u64,
    pub timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(contract_address: Address, last_checked_block: u64) -> Self {
        Self {
            contract_address,
            last_checked_block,
            timestamp: Utc::now(),
        }
    }
}

/// Records are appended, never mutated, so independent sessions can share a
/// store without coordinating.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns only once the record is durable.
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    /// The record with the greatest timestamp for `contract_address`. Ties go
    /// to the higher block.
    async fn load_latest(
        &self,
        contract_address: Address,
    ) -> Result<Option<CheckpointRecord>, CheckpointError>;
}

/// One JSON file per save, named `<contractAddress>_<unixSeconds>_<nanos>.json`.
/// Every save gets its own file unless two records carry the exact same
/// timestamp.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_prefix(contract_address: Address) -> String {
        format!("{contract_address:?}_")
    }

    // sub-second part keeps saves within the same second from replacing
    // each other
    fn file_name(record: &CheckpointRecord) -> String {
        format!(
            "{}{}_{:09}.json",
            Self::file_prefix(record.contract_address),
            record.timestamp.timestamp(),
            record.timestamp.timestamp_subsec_nanos()
        )
    }

    async fn read_record(path: &Path) -> Result<CheckpointRecord, String> {
        let content = fs::read(path).await.map_err(|err| err.to_string())?;
        serde_json::from_slice(&content).map_err(|err| err.to_string())
    }
}

impl Default for JsonFileStore {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_DIR)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError {
    let path = path.to_path_buf();
    move |source| CheckpointError::Io { path, source }
}

#[async_trait]
impl CheckpointStore for JsonFileStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        let content =
            serde_json::to_vec_pretty(record).map_err(|source| CheckpointError::Encode {
                contract_address: record.contract_address,
                source,
            })?;

        let file_name = Self::file_name(record);
        let path = self.dir.join(&file_name);
        let tmp_path = self.dir.join(format!("{file_name}.tmp"));

        // write then rename so readers never see a partial record
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(io_error(&tmp_path))?;
        file.write_all(&content)
            .await
            .map_err(io_error(&tmp_path))?;
        file.sync_all().await.map_err(io_error(&tmp_path))?;
        drop(file);
        fs::rename(&tmp_path, &path)
            .await
            .map_err(io_error(&path))?;

        tracing::debug!(
            contract = ?record.contract_address,
            block = record.last_checked_block,
            path = %path.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn load_latest(
        &self,
        contract_address: Address,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&self.dir)(err)),
        };

        let prefix = Self::file_prefix(contract_address);
        let mut latest: Option<(CheckpointRecord, String)> = None;
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.dir))? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.starts_with(&prefix) || !file_name.ends_with(".json") {
                continue;
            }

            let path = entry.path();
            let record = match Self::read_record(&path).await {
                Ok(record) if record.contract_address == contract_address => record,
                Ok(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        "checkpoint file belongs to another contract, skipping"
                    );
                    continue;
                }
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        "unreadable checkpoint file, skipping: {error}"
                    );
                    continue;
                }
            };

            let newer = match &latest {
                None => true,
                Some((current, current_name)) => {
                    (record.timestamp, record.last_checked_block, &file_name)
                        > (current.timestamp, current.last_checked_block, current_name)
                }
            };
            if newer {
                latest = Some((record, file_name));
            }
        }

        Ok(latest.map(|(record, _)| record))
    }
}

/// Append-only in-memory store, for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Address, Vec<CheckpointRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self, contract_address: Address) -> Vec<CheckpointRecord> {
        self.records
            .lock()
            .await
            .get(&contract_address)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        self.records
            .lock()
            .await
            .entry(record.contract_address)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn load_latest(
        &self,
        contract_address: Address,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.records.lock().await.get(&contract_address).and_then(|records| {
            records
                .iter()
                .max_by_key(|record| (record.timestamp, record.last_checked_block))
                .cloned()
        }))
    }
}
