//! 时间点恢复流水线测试
//!
//! 捕获 → 版本列表 → 对账 → 写回表

use super::*;
use crate::{
    backends::memory::{MemoryChangeLog, MemoryObjectStore, MemoryTable},
    error::BackupError,
    persistence::{ObjectStore, PutOptions},
    PointInTimeRestore, StreamBackupService,
};
use std::{sync::Arc, time::Duration};
use tracing::info;

/// 记录每个阶段结束时的存储时钟
struct History {
    store: Arc<MemoryObjectStore>,
    after_insert: DateTime<Utc>,
    after_modify: DateTime<Utc>,
    after_remove: DateTime<Utc>,
}

/// 构造如下历史（每个阶段间隔1秒）：
/// 1. 用户1写入 "alice"，用户2写入 "bob"
/// 2. 用户1改为 "alice-2"
/// 3. 删除用户1，新增用户3
async fn build_history() -> History {
    init_logging();
    let store = Arc::new(MemoryObjectStore::new());
    store.put_placeholder(&format!("{}/", PREFIX)).await;

    let service = StreamBackupService::new(
        capture_config(),
        Arc::new(MemoryChangeLog::new("users")),
        Arc::new(MemoryTable::new(vec!["id".to_string()])),
        store.clone(),
    );

    service
        .backup_stream_events(vec![change(1, EventKind::Insert, "alice"), change(2, EventKind::Insert, "bob")])
        .await
        .unwrap();
    let after_insert = store.now().await;
    store.advance_clock(Duration::from_secs(1)).await;

    service
        .backup_stream_events(vec![change(1, EventKind::Modify, "alice-2")])
        .await
        .unwrap();
    let after_modify = store.now().await;
    store.advance_clock(Duration::from_secs(1)).await;

    service
        .backup_stream_events(vec![change(1, EventKind::Remove, ""), change(3, EventKind::Insert, "carol")])
        .await
        .unwrap();
    let after_remove = store.now().await;

    History {
        store,
        after_insert,
        after_modify,
        after_remove,
    }
}

async fn restore_into(history: &History, target: Option<DateTime<Utc>>, table: Arc<MemoryTable>) -> crate::Result<crate::restore::RestoreStats> {
    PointInTimeRestore::new(restore_config(target), history.store.clone(), table)
        .restore()
        .await
}

#[tokio::test]
async fn test_restore_to_each_point_in_time() {
    let history = build_history().await;

    info!("⏪ 恢复到第一阶段之后");
    let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    let stats = restore_into(&history, Some(history.after_insert), table.clone()).await.unwrap();
    assert_eq!(table.items().await, vec![user(1, "alice"), user(2, "bob")]);
    // 用户3当时还不存在，按删除处理
    assert_eq!(stats.puts, 2);
    assert_eq!(stats.deletes, 1);

    info!("⏪ 恢复到第二阶段之后");
    let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    restore_into(&history, Some(history.after_modify), table.clone()).await.unwrap();
    assert_eq!(table.items().await, vec![user(1, "alice-2"), user(2, "bob")]);

    info!("⏪ 恢复到第三阶段之后，目标表里残留的用户1应被删除");
    let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    table.insert(user(1, "stale")).await;
    let stats = restore_into(&history, Some(history.after_remove), table.clone()).await.unwrap();
    assert_eq!(table.items().await, vec![user(2, "bob"), user(3, "carol")]);
    assert_eq!(stats.deletes, 1);
    assert_eq!(stats.gaps_skipped, 0);
}

#[tokio::test]
async fn test_restore_without_time_uses_latest_state() {
    let history = build_history().await;

    let latest = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    restore_into(&history, None, latest.clone()).await.unwrap();

    let at_end = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    restore_into(&history, Some(history.after_remove), at_end.clone()).await.unwrap();

    assert_eq!(latest.items().await, at_end.items().await);
}

#[tokio::test]
async fn test_restore_before_any_backup_deletes_everything() {
    let history = build_history().await;
    let before = history.after_insert - chrono::Duration::seconds(10);

    let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    for id in 1..=3 {
        table.insert(user(id, "live")).await;
    }

    let stats = restore_into(&history, Some(before), table.clone()).await.unwrap();
    assert_eq!(stats.puts, 0);
    assert_eq!(stats.deletes, 3);
    assert!(table.items().await.is_empty());
}

#[tokio::test]
async fn test_tombstone_only_address_is_skipped() {
    let history = build_history().await;
    history.store.delete(&address(99)).await.unwrap();

    let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    let stats = restore_into(&history, None, table.clone()).await.unwrap();

    assert_eq!(stats.gaps_skipped, 1);
    assert_eq!(stats.failed(), 0);
    assert_eq!(table.items().await, vec![user(2, "bob"), user(3, "carol")]);
}

#[tokio::test]
async fn test_unreadable_version_fails_only_its_address() {
    let history = build_history().await;
    history
        .store
        .put(&address(42), b"not json".to_vec(), &PutOptions::default())
        .await
        .unwrap();

    let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    let err = restore_into(&history, None, table.clone()).await.unwrap_err();

    match &err {
        BackupError::Partial { operation, failures } => {
            assert_eq!(operation, "restore");
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].address, address(42));
            assert!(matches!(failures[0].error, BackupError::Serialization(_)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(table.items().await, vec![user(2, "bob"), user(3, "carol")]);
}

#[tokio::test]
async fn test_sibling_prefix_is_not_restored() {
    let history = build_history().await;
    history
        .store
        .put(
            &format!("{}-archive/abc", PREFIX),
            crate::model::encode_item(&user(500, "foreign")).unwrap(),
            &PutOptions::default(),
        )
        .await
        .unwrap();

    let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    restore_into(&history, None, table.clone()).await.unwrap();

    assert_eq!(table.items().await, vec![user(2, "bob"), user(3, "carol")]);
}

#[tokio::test]
async fn test_rejected_item_does_not_fail_its_batch_siblings() {
    let history = build_history().await;
    let mut keyless = Item::new();
    keyless.insert("name".to_string(), AttributeValue::S("ghost".to_string()));
    history
        .store
        .put(&address(77), crate::model::encode_item(&keyless).unwrap(), &PutOptions::default())
        .await
        .unwrap();

    let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    let err = restore_into(&history, None, table.clone()).await.unwrap_err();

    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].address, address(77));
    assert_eq!(table.items().await, vec![user(2, "bob"), user(3, "carol")]);
}

#[tokio::test]
async fn test_invalid_config_fails_before_listing() {
    let history = build_history().await;
    let mut config = restore_config(None);
    config.batch_size = 0;

    let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
    let err = PointInTimeRestore::new(config, history.store.clone(), table).restore().await.unwrap_err();

    assert!(matches!(err, BackupError::Configuration(_)));
    assert_eq!(history.store.list_calls().await, 0);
}
