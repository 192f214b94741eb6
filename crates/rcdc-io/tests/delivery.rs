//! End-to-end delivery guarantees of the unbounded reader

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rcdc_core::{
    CdcError, ChangeEvent, ConnectorConfig, EngineSpec, OffsetStore, OffsetStoreError, Operation,
    PartitionOffsetMap, Record, RecordKind, SourceOffset, SourcePartition,
};
use rcdc_io::engine_memory::MemoryEngine;
use rcdc_io::offset_store::{FileOffsetStore, MemoryOffsetStore};
use rcdc_io::{ReaderState, UnboundedSourceReader};
use serde_json::json;

fn config(id: &str) -> ConnectorConfig {
    let mut cfg = ConnectorConfig::new(id, EngineSpec::Memory);
    cfg.advance_timeout_ms = 100;
    cfg
}

fn change(partition: &str, offset: u64, op: Operation) -> ChangeEvent {
    let value = (op != Operation::Delete).then(|| json!({"offset": offset}));
    ChangeEvent::new(partition, offset, op, json!({"id": offset % 7}), value, 1_000 + offset as i64)
}

fn live(partition: &str, offsets: std::ops::RangeInclusive<u64>) -> Vec<ChangeEvent> {
    offsets.map(|o| change(partition, o, Operation::Insert)).collect()
}

/// Advance until the reader has been idle for one full timeout.
async fn drain(reader: &mut UnboundedSourceReader) -> Vec<Record> {
    let mut out = Vec::new();
    while reader.advance().await.unwrap() {
        out.push(reader.current_record().unwrap().clone());
    }
    out
}

async fn take(reader: &mut UnboundedSourceReader, n: usize) -> Vec<Record> {
    let mut out = Vec::new();
    while out.len() < n {
        if reader.advance().await.unwrap() {
            out.push(reader.current_record().unwrap().clone());
        }
    }
    out
}

fn offsets_of(records: &[Record], partition: &str) -> Vec<u64> {
    records
        .iter()
        .filter(|r| r.partition.as_str() == partition)
        .map(|r| r.offset.0)
        .collect()
}

#[tokio::test]
async fn test_offsets_strictly_increase_per_partition() {
    let mut script = Vec::new();
    for o in 1..=20 {
        script.push(change("inv.a", o, Operation::Insert));
        script.push(change("inv.b", o * 3, Operation::Update));
        // engine hiccup: repeats an already emitted position
        if o % 5 == 0 {
            script.push(change("inv.a", o - 2, Operation::Insert));
        }
    }
    let engine = MemoryEngine::new().with_changes(script).with_batch_size(7);
    let mut reader =
        UnboundedSourceReader::new(config("db1"), Box::new(engine), Arc::new(MemoryOffsetStore::new()));
    reader.start().await.unwrap();
    let records = drain(&mut reader).await;
    reader.close().await;

    for partition in ["inv.a", "inv.b"] {
        let seen = offsets_of(&records, partition);
        assert_eq!(seen.len(), 20, "{partition}");
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{partition}: {seen:?}");
    }
}

#[tokio::test]
async fn test_checkpoint_restart_round_trip() {
    let store = Arc::new(MemoryOffsetStore::new());
    let script = live("p", 1..=10);

    let engine = MemoryEngine::new().with_changes(script.clone());
    let mut first = UnboundedSourceReader::new(config("db1"), Box::new(engine), store.clone());
    first.start().await.unwrap();
    let delivered = take(&mut first, 6).await;
    assert_eq!(offsets_of(&delivered, "p"), vec![1, 2, 3, 4, 5, 6]);
    let mark = first.checkpoint_mark().unwrap();
    assert_eq!(mark.offsets().get(&SourcePartition::from("p")), Some(SourceOffset(6)));
    mark.finalize_checkpoint().await.unwrap();
    first.close().await;

    // the engine replays from the beginning; the reader must still hold the line
    let engine = MemoryEngine::new().with_changes(script).ignore_initial_offsets();
    let mut second = UnboundedSourceReader::new(config("db1"), Box::new(engine), store.clone());
    second.start().await.unwrap();
    let redelivered = drain(&mut second).await;
    second.close().await;
    assert_eq!(offsets_of(&redelivered, "p"), vec![7, 8, 9, 10]);
}

#[tokio::test]
async fn test_crash_before_commit_replays_from_last_commit() {
    let store = Arc::new(MemoryOffsetStore::new());
    let script = live("p", 1..=8);

    let engine = MemoryEngine::new().with_changes(script.clone());
    let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store.clone());
    reader.start().await.unwrap();
    take(&mut reader, 3).await;
    reader.checkpoint_mark().unwrap().finalize_checkpoint().await.unwrap();
    take(&mut reader, 3).await;
    // a mark is taken but the worker dies before it is finalized
    let abandoned = reader.checkpoint_mark().unwrap();
    assert_eq!(abandoned.offsets().get(&"p".into()), Some(SourceOffset(6)));
    drop(abandoned);
    drop(reader);

    let engine = MemoryEngine::new().with_changes(script);
    let mut restarted = UnboundedSourceReader::new(config("db1"), Box::new(engine), store);
    restarted.start().await.unwrap();
    let replay = drain(&mut restarted).await;
    restarted.close().await;
    // 4..=6 are duplicates of the lost lifetime; nothing is missing
    assert_eq!(offsets_of(&replay, "p"), vec![4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn test_cold_start_snapshots_then_streams() {
    let snapshot = vec![
        change("db1.users", 1, Operation::Insert),
        change("db1.users", 2, Operation::Insert),
        change("db1.orders", 1, Operation::Insert),
    ];
    let changes = vec![
        change("db1.users", 3, Operation::Insert),
        change("db1.users", 4, Operation::Update),
        change("db1.orders", 2, Operation::Delete),
    ];
    let engine = MemoryEngine::new().with_snapshot(snapshot).with_changes(changes);
    let store = Arc::new(MemoryOffsetStore::new());
    let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store);
    reader.start().await.unwrap();
    let records = drain(&mut reader).await;
    reader.close().await;

    let kinds: Vec<RecordKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            RecordKind::Snapshot,
            RecordKind::Snapshot,
            RecordKind::Snapshot,
            RecordKind::Insert,
            RecordKind::Update,
            RecordKind::Delete,
        ]
    );
    assert!(records[5].is_tombstone());
}

#[tokio::test]
async fn test_resume_from_stored_offset() {
    let store = Arc::new(MemoryOffsetStore::new());
    let stored: PartitionOffsetMap = [(SourcePartition::from("partitionA"), SourceOffset(100))]
        .into_iter()
        .collect();
    store.commit("db1", &stored).await.unwrap();

    let engine = MemoryEngine::new()
        .with_snapshot(live("partitionA", 1..=3))
        .with_changes(live("partitionA", 98..=103));
    let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store);
    reader.start().await.unwrap();
    let records = drain(&mut reader).await;
    reader.close().await;

    assert_eq!(offsets_of(&records, "partitionA"), vec![101, 102, 103]);
    assert!(records.iter().all(|r| r.kind == RecordKind::Insert));
}

#[tokio::test]
async fn test_idle_consumer_applies_backpressure() {
    let mut cfg = config("db1");
    cfg.queue_capacity = 8;
    let engine = MemoryEngine::new().with_changes(live("p", 1..=1000)).with_batch_size(1);
    let delivered = engine.delivered_counter();
    let mut reader = UnboundedSourceReader::new(cfg, Box::new(engine), Arc::new(MemoryOffsetStore::new()));
    reader.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 8);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 8);

    let got = take(&mut reader, 20).await;
    assert_eq!(offsets_of(&got, "p"), (1..=20).collect::<Vec<_>>());
    reader.close().await;
}

#[tokio::test]
async fn test_engine_fault_fails_reader_but_close_succeeds() {
    let engine = MemoryEngine::new()
        .with_changes(live("p", 1..=5))
        .fail_after(5, "binlog position no longer available");
    let mut reader =
        UnboundedSourceReader::new(config("db1"), Box::new(engine), Arc::new(MemoryOffsetStore::new()));
    reader.start().await.unwrap();
    let records = take(&mut reader, 5).await;
    assert_eq!(records.len(), 5);

    let err = loop {
        match reader.advance().await {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(err.is_fatal());
    assert_eq!(reader.state(), ReaderState::Failed);
    assert!(reader.advance().await.unwrap_err().is_usage());
    reader.close().await;
    assert_eq!(reader.state(), ReaderState::Closed);
}

#[tokio::test]
async fn test_start_failure_is_fatal() {
    let engine = MemoryEngine::new().fail_on_open("access denied for user 'cdc'");
    let mut reader =
        UnboundedSourceReader::new(config("db1"), Box::new(engine), Arc::new(MemoryOffsetStore::new()));
    let err = reader.start().await.unwrap_err();
    assert!(matches!(err, CdcError::StartFailed(_)));
    assert_eq!(reader.state(), ReaderState::Failed);
    reader.close().await;
}

/// Store that can be switched off to simulate an outage
#[derive(Default)]
struct FlakyStore {
    inner: MemoryOffsetStore,
    down: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl OffsetStore for FlakyStore {
    async fn load(&self, connector_id: &str) -> Result<PartitionOffsetMap, OffsetStoreError> {
        self.inner.load(connector_id).await
    }

    async fn commit(&self, connector_id: &str, offsets: &PartitionOffsetMap) -> Result<(), OffsetStoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(OffsetStoreError::Unavailable("coordination service unreachable".into()));
        }
        self.inner.commit(connector_id, offsets).await
    }
}

#[tokio::test]
async fn test_commit_failure_does_not_crash_reader() {
    let store = Arc::new(FlakyStore::default());
    let engine = MemoryEngine::new().with_changes(live("p", 1..=6));
    let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store.clone());
    reader.start().await.unwrap();

    take(&mut reader, 2).await;
    store.down.store(true, Ordering::SeqCst);
    let err = reader.checkpoint_mark().unwrap().finalize_checkpoint().await.unwrap_err();
    assert!(matches!(err, CdcError::OffsetStore(_)));
    assert!(!err.is_fatal());

    // reader keeps going, and the next commit covers the earlier records too
    take(&mut reader, 2).await;
    store.down.store(false, Ordering::SeqCst);
    let mark = reader.checkpoint_mark().unwrap();
    mark.finalize_checkpoint().await.unwrap();
    assert_eq!(store.load("db1").await.unwrap().get(&"p".into()), Some(SourceOffset(4)));
    reader.close().await;
}

#[tokio::test]
async fn test_late_finalize_of_older_mark_never_regresses() {
    let store = Arc::new(MemoryOffsetStore::new());
    let engine = MemoryEngine::new().with_changes(live("p", 1..=4));
    let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store.clone());
    reader.start().await.unwrap();
    take(&mut reader, 2).await;
    let older = reader.checkpoint_mark().unwrap();
    take(&mut reader, 2).await;
    let newer = reader.checkpoint_mark().unwrap();

    newer.finalize_checkpoint().await.unwrap();
    older.finalize_checkpoint().await.unwrap();
    assert_eq!(store.load("db1").await.unwrap().get(&"p".into()), Some(SourceOffset(4)));
    reader.close().await;
}

#[tokio::test]
async fn test_file_store_survives_reader_restart() {
    let dir = tempfile::tempdir().unwrap();
    let script = live("inv.c", 1..=5);

    {
        let store = Arc::new(FileOffsetStore::open(dir.path()).unwrap());
        let engine = MemoryEngine::new().with_changes(script.clone());
        let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store);
        reader.start().await.unwrap();
        take(&mut reader, 3).await;
        reader.checkpoint_mark().unwrap().finalize_checkpoint().await.unwrap();
        reader.close().await;
    }

    let store = Arc::new(FileOffsetStore::open(dir.path()).unwrap());
    let engine = MemoryEngine::new().with_changes(script);
    let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store);
    reader.start().await.unwrap();
    let rest = drain(&mut reader).await;
    reader.close().await;
    assert_eq!(offsets_of(&rest, "inv.c"), vec![4, 5]);
}

#[tokio::test]
async fn test_framework_held_mark_overrides_older_store_state() {
    let store = Arc::new(MemoryOffsetStore::new());
    let held: PartitionOffsetMap = [(SourcePartition::from("p"), SourceOffset(7))].into_iter().collect();
    let engine = MemoryEngine::new().with_changes(live("p", 1..=9)).ignore_initial_offsets();
    let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store).with_checkpoint(held);
    reader.start().await.unwrap();
    let records = drain(&mut reader).await;
    reader.close().await;
    assert_eq!(offsets_of(&records, "p"), vec![8, 9]);
}

#[tokio::test]
async fn test_independent_readers_do_not_share_state() {
    let store = Arc::new(MemoryOffsetStore::new());
    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("db{worker}");
            let engine = MemoryEngine::new().with_changes(live("p", 1..=(10 + worker)));
            let mut reader = UnboundedSourceReader::new(config(&id), Box::new(engine), store);
            reader.start().await.unwrap();
            let records = drain(&mut reader).await;
            reader.checkpoint_mark().unwrap().finalize_checkpoint().await.unwrap();
            reader.close().await;
            (id, records.len() as u64)
        }));
    }
    let mut counts = HashMap::new();
    for handle in handles {
        let (id, n) = handle.await.unwrap();
        counts.insert(id, n);
    }
    for worker in 0..4u64 {
        let id = format!("db{worker}");
        assert_eq!(counts[&id], 10 + worker);
        assert_eq!(store.load(&id).await.unwrap().get(&"p".into()), Some(SourceOffset(10 + worker)));
    }
}

#[tokio::test]
async fn test_close_interrupts_in_flight_advance() {
    let mut cfg = config("db1");
    cfg.advance_timeout_ms = 10_000;
    let mut reader =
        UnboundedSourceReader::new(cfg, Box::new(MemoryEngine::new()), Arc::new(MemoryOffsetStore::new()));
    reader.start().await.unwrap();

    let shutdown = reader.shutdown_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
    });
    let advanced = tokio::time::timeout(Duration::from_secs(2), reader.advance())
        .await
        .expect("advance was not interrupted")
        .unwrap();
    assert!(!advanced);
    reader.close().await;
    assert_eq!(reader.state(), ReaderState::Closed);
}

fn snapshot_rows() -> Vec<ChangeEvent> {
    vec![
        change("inv.a", 1, Operation::Insert),
        change("inv.a", 2, Operation::Insert),
        change("inv.a", 3, Operation::Insert),
        change("inv.b", 1, Operation::Insert),
        change("inv.b", 2, Operation::Insert),
    ]
}

fn ids(records: &[Record]) -> Vec<String> {
    records.iter().map(|r| r.id().to_string()).collect()
}

#[tokio::test]
async fn test_checkpoint_inside_snapshot_resumes_the_snapshot() {
    let store = Arc::new(MemoryOffsetStore::new());
    let changes = vec![change("inv.a", 4, Operation::Update)];

    let engine = MemoryEngine::new().with_snapshot(snapshot_rows()).with_changes(changes.clone());
    let mut first = UnboundedSourceReader::new(config("db1"), Box::new(engine), store.clone());
    first.start().await.unwrap();
    let partial = take(&mut first, 2).await;
    assert_eq!(ids(&partial), vec!["inv.a@1", "inv.a@2"]);
    first.checkpoint_mark().unwrap().finalize_checkpoint().await.unwrap();
    first.close().await;
    assert!(!store.load("db1").await.unwrap().snapshot_complete());

    let engine = MemoryEngine::new().with_snapshot(snapshot_rows()).with_changes(changes.clone());
    let mut second = UnboundedSourceReader::new(config("db1"), Box::new(engine), store.clone());
    second.start().await.unwrap();
    let rest = drain(&mut second).await;
    assert_eq!(ids(&rest), vec!["inv.a@3", "inv.b@1", "inv.b@2", "inv.a@4"]);
    assert!(rest[..3].iter().all(|r| r.kind == RecordKind::Snapshot));
    second.checkpoint_mark().unwrap().finalize_checkpoint().await.unwrap();
    second.close().await;
    assert!(store.load("db1").await.unwrap().snapshot_complete());

    // once completion is committed the snapshot is never replayed
    let engine = MemoryEngine::new()
        .with_snapshot(snapshot_rows())
        .with_changes(vec![change("inv.a", 4, Operation::Update), change("inv.b", 9, Operation::Delete)])
        .ignore_initial_offsets();
    let mut third = UnboundedSourceReader::new(config("db1"), Box::new(engine), store);
    third.start().await.unwrap();
    let tail = drain(&mut third).await;
    third.close().await;
    assert_eq!(ids(&tail), vec!["inv.b@9"]);
}

#[tokio::test]
async fn test_snapshot_progress_survives_file_store_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = Arc::new(FileOffsetStore::open(dir.path()).unwrap());
        let engine = MemoryEngine::new().with_snapshot(snapshot_rows());
        let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store);
        reader.start().await.unwrap();
        take(&mut reader, 4).await;
        reader.checkpoint_mark().unwrap().finalize_checkpoint().await.unwrap();
        reader.close().await;
    }

    let store = Arc::new(FileOffsetStore::open(dir.path()).unwrap());
    let engine = MemoryEngine::new().with_snapshot(snapshot_rows());
    let mut reader = UnboundedSourceReader::new(config("db1"), Box::new(engine), store);
    reader.start().await.unwrap();
    let rest = drain(&mut reader).await;
    reader.close().await;
    assert_eq!(ids(&rest), vec!["inv.b@2"]);
}
