//! EventLog behaviour over the in-memory storage.

use std::collections::HashSet;
use std::sync::Arc;

use arbor_events::{
    AppendEvent, AppendOptions, Category, EventLog, EventType, HistoryError, Kind,
    MemoryStorage, PartitionId, ReadOptions,
};
use serde_json::json;

async fn open() -> (EventLog, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let log = EventLog::open(storage.clone()).await.unwrap();
    (log, storage)
}

fn kind(kind: Kind) -> EventType {
    EventType::new(Category::Activity, kind)
}

#[tokio::test]
async fn partition_reads_have_no_gaps() {
    let (log, _) = open().await;
    let a = PartitionId::agent("a").unwrap();
    let b = PartitionId::agent("b").unwrap();

    for i in 0..10 {
        let target = if i % 3 == 0 { &b } else { &a };
        log.append(target, kind(Kind::TaskStarted), json!({"i": i}), AppendOptions::default())
            .await
            .unwrap();
    }

    for partition in [&a, &b, &PartitionId::global()] {
        let events = log.read_partition(partition, ReadOptions::default()).await.unwrap();
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_in_partition, i as i64);
        }
    }
    let global = log
        .read_partition(&PartitionId::global(), ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(global.len(), 10);
}

#[tokio::test]
async fn global_order_interleaves_partitions_without_sharing_values() {
    let (log, _) = open().await;
    let a = PartitionId::session("s-a").unwrap();
    let b = PartitionId::session("s-b").unwrap();
    for i in 0..6 {
        let target = if i % 2 == 0 { &a } else { &b };
        log.append(target, kind(Kind::TaskCompleted), json!({}), AppendOptions::default())
            .await
            .unwrap();
    }

    let mut merged: Vec<i64> = Vec::new();
    for p in [&a, &b] {
        merged.extend(
            log.read_partition(p, ReadOptions::default())
                .await
                .unwrap()
                .iter()
                .map(|e| e.global_order),
        );
    }
    merged.sort_unstable();
    assert!(merged.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(merged.len(), 6);
}

#[tokio::test]
async fn fanout_copies_share_identity() {
    let (log, _) = open().await;
    let draft = AppendEvent::new(kind(Kind::AgentStarted), json!({"agent_id": "a1"}));
    let copies = log
        .append_fanout(
            &[PartitionId::category(Category::Activity).unwrap(), PartitionId::agent("a1").unwrap()],
            draft.clone(),
        )
        .await
        .unwrap();

    assert_eq!(copies.len(), 3);
    assert!(copies[0].partition_id.is_global());
    let ids: HashSet<_> = copies.iter().map(|c| c.id.as_str()).collect();
    let orders: HashSet<_> = copies.iter().map(|c| c.global_order).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(orders.len(), 1);
    assert!(copies.iter().all(|c| c.payload == draft.payload));
}

#[tokio::test]
async fn concurrent_auto_assigned_appends_never_collide() {
    let (log, _) = open().await;
    let partition = PartitionId::agent("busy").unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let log = log.clone();
        let partition = partition.clone();
        handles.push(tokio::spawn(async move {
            log.append(&partition, kind(Kind::TaskStarted), json!({"i": i}), AppendOptions::default())
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let events = log.read_partition(&partition, ReadOptions::default()).await.unwrap();
    let sequences: Vec<i64> = events.iter().map(|e| e.sequence_in_partition).collect();
    assert_eq!(sequences, (0..32).collect::<Vec<_>>());
}

#[tokio::test]
async fn incremental_reads_with_floor_and_ceiling() {
    let (log, _) = open().await;
    let p = PartitionId::correlation("op-1").unwrap();
    for _ in 0..5 {
        log.append(&p, kind(Kind::TaskStarted), json!({}), AppendOptions::default())
            .await
            .unwrap();
    }

    let tail = log.read_partition(&p, ReadOptions::from_sequence(3)).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].sequence_in_partition, 3);

    let window = ReadOptions {
        from_sequence: Some(1),
        to_sequence: Some(2),
        limit: None,
    };
    assert_eq!(log.read_partition(&p, window).await.unwrap().len(), 2);

    let limited = log
        .read_partition(&p, ReadOptions::default().with_limit(1))
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn unknown_partition_reads_empty() {
    let (log, _) = open().await;
    let events = log
        .read_partition(&PartitionId::agent("ghost").unwrap(), ReadOptions::default())
        .await
        .unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn read_by_global_order_replays_each_event_once() {
    let (log, _) = open().await;
    for i in 0..4 {
        log.append(
            &PartitionId::agent(&format!("a{i}")).unwrap(),
            kind(Kind::AgentStarted),
            json!({}),
            AppendOptions::default(),
        )
        .await
        .unwrap();
    }

    let all = log.read_by_global_order(1, None).await.unwrap();
    assert_eq!(all.iter().map(|e| e.global_order).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

    let middle = log.read_by_global_order(2, Some(3)).await.unwrap();
    assert_eq!(middle.len(), 2);
}

#[tokio::test]
async fn explicit_expected_sequence_detects_stale_writer() {
    let (log, _) = open().await;
    let p = PartitionId::agent("a1").unwrap();
    log.append(&p, kind(Kind::TaskStarted), json!({}), AppendOptions::default())
        .await
        .unwrap();

    let stale = log
        .append(&p, kind(Kind::TaskStarted), json!({}), AppendOptions::expecting(0))
        .await
        .unwrap_err();
    match stale {
        HistoryError::ConcurrencyConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("unexpected error: {other}"),
    }

    let fresh = log
        .append(&p, kind(Kind::TaskStarted), json!({}), AppendOptions::expecting(1))
        .await
        .unwrap();
    assert_eq!(fresh.sequence_in_partition, 1);
}

#[tokio::test]
async fn reopening_resumes_numbering() {
    let storage = Arc::new(MemoryStorage::new());
    let log = EventLog::open(storage.clone()).await.unwrap();
    let p = PartitionId::agent("a1").unwrap();
    log.append(&p, kind(Kind::AgentStarted), json!({}), AppendOptions::default())
        .await
        .unwrap();

    let reopened = EventLog::open(storage).await.unwrap();
    let next = reopened
        .append(&p, kind(Kind::AgentStopped), json!({}), AppendOptions::default())
        .await
        .unwrap();
    assert_eq!(next.sequence_in_partition, 1);
    assert_eq!(next.global_order, 2);
}

#[tokio::test]
async fn causation_lookup_reads_global_copies() {
    let (log, _) = open().await;
    let root = log
        .append(&PartitionId::global(), kind(Kind::TaskStarted), json!({}), AppendOptions::default())
        .await
        .unwrap();
    let opts = AppendOptions {
        causation_id: Some(root.id.clone()),
        ..AppendOptions::default()
    };
    let child = log
        .append(&PartitionId::agent("a1").unwrap(), kind(Kind::TaskCompleted), json!({}), opts)
        .await
        .unwrap();

    let caused = log.read_caused_by(&root.id).await.unwrap();
    assert_eq!(caused.len(), 1);
    assert_eq!(caused[0].id, child.id);
    assert!(caused[0].partition_id.is_global());
}
