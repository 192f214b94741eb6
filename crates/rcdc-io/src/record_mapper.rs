use rcdc_core::{CdcError, ChangeEvent, Operation, Record, RecordKind, SchemaChangePolicy};

/// Turns engine change events into downstream records
///
/// Mapping is a pure function of the event and the schema-change policy:
/// the same event always yields an identical record, which keeps replays
/// after a restart indistinguishable from the first delivery.
#[derive(Debug, Clone, Copy)]
pub struct RecordMapper {
    schema_changes: SchemaChangePolicy,
}

impl RecordMapper {
    pub fn new(schema_changes: SchemaChangePolicy) -> Self {
        Self { schema_changes }
    }

    /// Returns `Ok(None)` for events filtered out of the stream.
    ///
    /// An insert, update, or snapshot row without a row image cannot be
    /// turned into a complete record and is reported as a fatal decode fault.
    pub fn map(&self, event: &ChangeEvent) -> Result<Option<Record>, CdcError> {
        let value = match event.operation {
            Operation::SchemaChange if self.schema_changes == SchemaChangePolicy::Skip => {
                return Ok(None)
            }
            Operation::SchemaChange => event.value.clone(),
            // tombstone, whatever before-image the engine attached
            Operation::Delete => None,
            Operation::Insert | Operation::Update | Operation::Snapshot => {
                match &event.value {
                    Some(row) => Some(row.clone()),
                    None => {
                        return Err(CdcError::Fatal(format!(
                            "{} event at {}@{} carries no row image",
                            event.operation, event.partition, event.offset
                        )))
                    }
                }
            }
        };
        Ok(Some(Record {
            key: event.key.clone(),
            value,
            timestamp_ms: event.timestamp_ms,
            partition: event.partition.clone(),
            offset: event.offset,
            kind: RecordKind::from(event.operation),
        }))
    }
}

impl Default for RecordMapper {
    fn default() -> Self {
        Self::new(SchemaChangePolicy::Skip)
    }
}
