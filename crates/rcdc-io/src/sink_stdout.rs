use std::io::Write;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datafusion::arrow::array::{Array, Int64Array, RecordBatch, StringArray, UInt64Array};
use datafusion::arrow::datatypes::SchemaRef;
use rcdc_core::{BatchRx, Message, Operator, Sink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct StdoutSink {
    id: String,
    schema: SchemaRef,
}

impl StdoutSink {
    pub fn new(id: String, schema: SchemaRef) -> Self {
        Self { id, schema }
    }
}

/// One line per envelope row: `<time> <op> <partition>@<offset> key=<json> value=<json|null>`
pub fn format_rows(batch: &RecordBatch) -> anyhow::Result<Vec<String>> {
    fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a T> {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<T>())
            .ok_or_else(|| anyhow::anyhow!("batch has no envelope column {name:?}"))
    }
    let partition = column::<StringArray>(batch, "partition")?;
    let offset = column::<UInt64Array>(batch, "offset")?;
    let op = column::<StringArray>(batch, "op")?;
    let ts = column::<Int64Array>(batch, "ts_ms")?;
    let key = column::<StringArray>(batch, "key")?;
    let value = column::<StringArray>(batch, "value")?;

    Ok((0..batch.num_rows())
        .map(|row| {
            let when = DateTime::<Utc>::from_timestamp_millis(ts.value(row))
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| ts.value(row).to_string());
            let value = if value.is_null(row) { "null" } else { value.value(row) };
            format!(
                "{} {} {}@{} key={} value={}",
                when,
                op.value(row),
                partition.value(row),
                offset.value(row),
                key.value(row),
                value
            )
        })
        .collect())
}

#[async_trait]
impl Operator for StdoutSink {
    fn name(&self) -> &str {
        &self.id
    }
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn run(&mut self, mut rx: BatchRx, _cancel: CancellationToken) -> anyhow::Result<()> {
        let mut rows = 0usize;
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Batch(b) => {
                    for line in format_rows(&b)? {
                        println!("{}", line);
                    }
                    rows += b.num_rows();
                }
                Message::Watermark(ts) => {
                    println!("watermark={}", ts);
                }
                Message::Barrier(barrier) => {
                    std::io::stdout().flush()?;
                    debug!(sink = %self.id, checkpoint_id = barrier.checkpoint_id, "barrier acknowledged");
                    barrier.ack();
                }
                Message::Eos => break,
            }
        }
        info!(sink = %self.id, rows, "stdout sink finished");
        Ok(())
    }
}
