use std::fmt;
use std::sync::Arc;

use rcdc_core::{CdcError, OffsetStore, OffsetStoreError, PartitionOffsetMap};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Immutable snapshot of delivered offsets, committed on finalize
///
/// Everything the reader surfaced before the mark was taken is covered by it.
/// A mark that is dropped without being finalized leaves the store untouched,
/// so a restart replays from the last finalized mark.
#[derive(Clone)]
pub struct CheckpointMark {
    connector_id: String,
    offsets: PartitionOffsetMap,
    store: Arc<dyn OffsetStore>,
}

/// Serialized form of a mark, for frameworks that persist marks themselves
#[derive(Serialize, Deserialize)]
struct EncodedMark {
    connector: String,
    offsets: PartitionOffsetMap,
}

impl CheckpointMark {
    pub(crate) fn new(
        connector_id: String,
        offsets: PartitionOffsetMap,
        store: Arc<dyn OffsetStore>,
    ) -> Self {
        Self {
            connector_id,
            offsets,
            store,
        }
    }

    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    pub fn offsets(&self) -> &PartitionOffsetMap {
        &self.offsets
    }

    /// Commit the snapshot to the offset store.
    ///
    /// Failures are returned as-is; retrying or restarting from the last
    /// successful commit is up to the caller.
    pub async fn finalize_checkpoint(&self) -> Result<(), CdcError> {
        if let Err(e) = self.store.commit(&self.connector_id, &self.offsets).await {
            warn!(connector = %self.connector_id, error = %e, "checkpoint commit failed");
            return Err(e.into());
        }
        info!(
            connector = %self.connector_id,
            partitions = self.offsets.len(),
            "checkpoint committed"
        );
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CdcError> {
        let encoded = EncodedMark {
            connector: self.connector_id.clone(),
            offsets: self.offsets.clone(),
        };
        Ok(serde_json::to_vec(&encoded).map_err(OffsetStoreError::from)?)
    }

    /// Rebuild a mark from [`CheckpointMark::encode`] output, bound to `store`.
    pub fn restore(bytes: &[u8], store: Arc<dyn OffsetStore>) -> Result<Self, CdcError> {
        let decoded: EncodedMark = serde_json::from_slice(bytes).map_err(OffsetStoreError::from)?;
        Ok(Self::new(decoded.connector, decoded.offsets, store))
    }
}

impl fmt::Debug for CheckpointMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointMark")
            .field("connector_id", &self.connector_id)
            .field("offsets", &self.offsets)
            .finish_non_exhaustive()
    }
}
