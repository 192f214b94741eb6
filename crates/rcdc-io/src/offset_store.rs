//! Offset store implementations.
//!
//! Both stores merge commits per partition with `max`, so a late finalize of an
//! older checkpoint can never move a stored position backwards.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use rcdc_core::{OffsetStore, OffsetStoreError, OffsetStoreSpec, PartitionOffsetMap};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Build the store described by `spec`.
pub fn from_spec(spec: &OffsetStoreSpec) -> Result<Arc<dyn OffsetStore>, OffsetStoreError> {
    Ok(match spec {
        OffsetStoreSpec::Memory => Arc::new(MemoryOffsetStore::new()),
        OffsetStoreSpec::File { dir } => Arc::new(FileOffsetStore::open(dir)?),
    })
}

/// Process-local store; survives reader restarts but not process restarts.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: RwLock<HashMap<String, PartitionOffsetMap>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> OffsetStoreError {
        OffsetStoreError::Unavailable("offset map lock poisoned".into())
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load(&self, connector_id: &str) -> Result<PartitionOffsetMap, OffsetStoreError> {
        let guard = self.offsets.read().map_err(|_| Self::poisoned())?;
        Ok(guard.get(connector_id).cloned().unwrap_or_default())
    }

    async fn commit(
        &self,
        connector_id: &str,
        offsets: &PartitionOffsetMap,
    ) -> Result<(), OffsetStoreError> {
        let mut guard = self.offsets.write().map_err(|_| Self::poisoned())?;
        guard
            .entry(connector_id.to_string())
            .or_default()
            .merge(offsets);
        Ok(())
    }
}

/// On-disk document, one per connector
#[derive(Debug, Serialize, Deserialize)]
struct OffsetDocument {
    connector: String,
    offsets: PartitionOffsetMap,
}

/// Directory-backed store holding one JSON document per connector
///
/// Each commit writes a fresh temp file and renames it over the previous
/// document, so a concurrent `load` sees either the old or the new map.
/// Commits for the same connector are serialized; different connectors
/// commit independently.
#[derive(Debug)]
pub struct FileOffsetStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileOffsetStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, OffsetStoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "file offset store ready");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Document path of a connector. ASCII letters, digits, and `-` are kept;
    /// every other byte becomes `_` plus two hex digits, so distinct ids never
    /// share a file.
    pub fn path_for(&self, connector_id: &str) -> PathBuf {
        let mut name = String::with_capacity(connector_id.len());
        for byte in connector_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(byte as char);
            } else {
                name.push_str(&format!("_{byte:02x}"));
            }
        }
        self.dir.join(format!("{name}.offsets.json"))
    }

    fn lock_for(&self, connector_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, OffsetStoreError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| OffsetStoreError::Unavailable("commit lock table poisoned".into()))?;
        Ok(locks.entry(connector_id.to_string()).or_default().clone())
    }

    async fn read_document(&self, connector_id: &str) -> Result<PartitionOffsetMap, OffsetStoreError> {
        let path = self.path_for(connector_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(connector = connector_id, "no stored offsets, cold start");
                return Ok(PartitionOffsetMap::new());
            }
            Err(e) => return Err(e.into()),
        };
        let doc: OffsetDocument = serde_json::from_slice(&bytes)?;
        if doc.connector != connector_id {
            return Err(OffsetStoreError::Unavailable(format!(
                "{} belongs to connector {:?}",
                path.display(),
                doc.connector
            )));
        }
        Ok(doc.offsets)
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn load(&self, connector_id: &str) -> Result<PartitionOffsetMap, OffsetStoreError> {
        self.read_document(connector_id).await
    }

    async fn commit(
        &self,
        connector_id: &str,
        offsets: &PartitionOffsetMap,
    ) -> Result<(), OffsetStoreError> {
        let lock = self.lock_for(connector_id)?;
        let _guard = lock.lock().await;

        let mut merged = self.read_document(connector_id).await?;
        merged.merge(offsets);
        let doc = OffsetDocument {
            connector: connector_id.to_string(),
            offsets: merged,
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let tmp = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(connector_id)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(connector = connector_id, partitions = doc.offsets.len(), "offsets written");
        Ok(())
    }
}
