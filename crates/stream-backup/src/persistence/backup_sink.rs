use crate::{
    error::{AddressFailure, BackupError, Result},
    model::{content_address, encode_item, ChangeEvent, EventKind},
    persistence::{
        object_store::{ObjectStore, PutOptions},
        sequencer::group_by_keys,
    },
    recovery::retry_manager::{with_retry, RetryPolicy},
};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info};

/// 一次写入备份的结果
#[derive(Debug, Default)]
pub struct SinkReport {
    /// 写入的内容版本数
    pub written: usize,
    /// 写入的删除标记数
    pub tombstones: usize,
    pub failures: Vec<AddressFailure>,
}

impl SinkReport {
    pub fn merge(&mut self, other: SinkReport) {
        self.written += other.written;
        self.tombstones += other.tombstones;
        self.failures.extend(other.failures);
    }

    /// 有失败时转换为 [`BackupError::Partial`]
    pub fn into_result(self, operation: &str) -> Result<SinkReport> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(BackupError::Partial {
                operation: operation.to_string(),
                failures: self.failures,
            })
        }
    }

    fn record(&mut self, kind: EventKind) {
        match kind {
            EventKind::Remove => self.tombstones += 1,
            _ => self.written += 1,
        }
    }
}

/// 以内容寻址方式把变更写入版本化对象存储
///
/// 每个主键对应一个固定地址，每次变更都在该地址上产生一个新版本，
/// REMOVE 产生删除标记。
pub struct BackupSink {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    put_options: PutOptions,
    retry: RetryPolicy,
}

impl BackupSink {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, put_options: PutOptions, retry: RetryPolicy) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            put_options,
            retry,
        }
    }

    /// 写入一批变更
    ///
    /// `sequential` 为真时按主键分组，组内逐个等待写入，某个写入失败后
    /// 该主键剩余的变更不再写入；不同主键之间并发。
    /// 为假时所有变更并发写入，收集全部失败。
    pub async fn backup(&self, changes: &[ChangeEvent], sequential: bool) -> SinkReport {
        if changes.is_empty() {
            return SinkReport::default();
        }

        let report = if sequential {
            self.backup_sequential(changes).await
        } else {
            self.backup_parallel(changes).await
        };

        info!(
            "💾 备份写入完成: {} 个版本, {} 个删除标记, {} 个失败",
            report.written,
            report.tombstones,
            report.failures.len()
        );
        report
    }

    async fn backup_sequential(&self, changes: &[ChangeEvent]) -> SinkReport {
        let groups = match group_by_keys(changes) {
            Ok(groups) => groups,
            Err(e) => {
                let mut report = SinkReport::default();
                report.failures.push(AddressFailure {
                    address: self.prefix.clone(),
                    error: e,
                });
                return report;
            }
        };
        debug!("🧮 {} 个变更分为 {} 个主键组", changes.len(), groups.len());

        let group_writes = groups.into_iter().map(|group| async move {
            let address = content_address(&self.prefix, &group.serialized_keys);
            let mut report = SinkReport::default();

            for (position, change) in group.events.iter().enumerate() {
                if let Err(e) = self.write_change(&address, change).await {
                    let skipped = group.events.len() - position - 1;
                    error!("❌ 地址 {} 写入失败，跳过该主键剩余 {} 个变更: {}", address, skipped, e);
                    report.failures.push(AddressFailure { address, error: e });
                    return report;
                }
                report.record(change.kind);
            }
            report
        });

        let mut report = SinkReport::default();
        for group_report in join_all(group_writes).await {
            report.merge(group_report);
        }
        report
    }

    async fn backup_parallel(&self, changes: &[ChangeEvent]) -> SinkReport {
        let writes = changes.iter().map(|change| async move {
            let address = match change.serialized_keys() {
                Ok(serialized) => content_address(&self.prefix, &serialized),
                Err(error) => {
                    return Err(AddressFailure {
                        address: self.prefix.clone(),
                        error,
                    })
                }
            };
            match self.write_change(&address, change).await {
                Ok(()) => Ok(change.kind),
                Err(error) => Err(AddressFailure { address, error }),
            }
        });

        let mut report = SinkReport::default();
        for outcome in join_all(writes).await {
            match outcome {
                Ok(kind) => report.record(kind),
                Err(failure) => {
                    error!("❌ 地址 {} 写入失败: {}", failure.address, failure.error);
                    report.failures.push(failure);
                }
            }
        }
        report
    }

    async fn write_change(&self, address: &str, change: &ChangeEvent) -> Result<()> {
        match change.kind {
            EventKind::Remove => {
                debug!("🪦 写入删除标记: {}", address);
                with_retry(&self.retry, "s3:DeleteObject", || self.store.delete(address)).await
            }
            EventKind::Insert | EventKind::Modify => {
                let image = change.new_image.as_ref().ok_or_else(|| {
                    BackupError::Unknown(format!("{} 事件缺少新镜像: {}", change.kind.as_str(), address))
                })?;
                let body = encode_item(image)?;
                debug!("📤 写入版本: {} ({} 字节)", address, body.len());
                with_retry(&self.retry, "s3:PutObject", || {
                    self.store.put(address, body.clone(), &self.put_options)
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::memory::MemoryObjectStore,
        error::RemoteError,
        model::{serialize_keys, AttributeValue, KeyMap},
    };
    use std::time::Duration;

    fn keys(id: &str) -> KeyMap {
        let mut keys = KeyMap::new();
        keys.insert("id".to_string(), AttributeValue::S(id.to_string()));
        keys
    }

    fn change(id: &str, kind: EventKind, version: u32) -> ChangeEvent {
        let mut image = keys(id);
        image.insert("v".to_string(), AttributeValue::N(version.to_string()));
        ChangeEvent {
            keys: keys(id),
            kind,
            new_image: (kind != EventKind::Remove).then_some(image),
            source_partition: "shard-1".to_string(),
        }
    }

    fn address(id: &str) -> String {
        content_address("backups/users", &serialize_keys(&keys(id)).unwrap())
    }

    fn sink(store: Arc<MemoryObjectStore>) -> BackupSink {
        BackupSink::new(
            store,
            "backups/users",
            PutOptions::default(),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn test_sequential_writes_versions_in_order() {
        let store = Arc::new(MemoryObjectStore::new());
        let changes = vec![
            change("a", EventKind::Insert, 1),
            change("a", EventKind::Modify, 2),
            change("a", EventKind::Remove, 0),
        ];

        let report = sink(store.clone()).backup(&changes, true).await;
        assert_eq!(report.written, 2);
        assert_eq!(report.tombstones, 1);
        assert!(report.failures.is_empty());

        let versions = store.versions_of(&address("a")).await;
        assert_eq!(versions.len(), 3);
        assert!(versions.windows(2).all(|w| w[0].last_modified < w[1].last_modified));
        assert!(!versions[0].is_tombstone);
        assert!(!versions[1].is_tombstone);
        assert!(versions[2].is_tombstone);
    }

    #[tokio::test]
    async fn test_uses_configured_put_options() {
        let store = Arc::new(MemoryObjectStore::new());
        sink(store.clone()).backup(&[change("a", EventKind::Insert, 1)], false).await;

        let options = store.put_options_of(&address("a")).await;
        assert_eq!(options, vec![PutOptions::default()]);
    }

    #[tokio::test]
    async fn test_sequential_failure_stops_only_that_address() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .fail_writes_to(&address("a"), RemoteError::permanent("s3:PutObject", "access denied"))
            .await;

        let changes = vec![
            change("a", EventKind::Insert, 1),
            change("b", EventKind::Insert, 1),
            change("a", EventKind::Modify, 2),
            change("b", EventKind::Modify, 2),
        ];

        let report = sink(store.clone()).backup(&changes, true).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].address, address("a"));
        assert_eq!(report.written, 2);
        assert_eq!(store.versions_of(&address("b")).await.len(), 2);
        assert!(store.versions_of(&address("a")).await.is_empty());

        let err = report.into_result("capture").unwrap_err();
        assert_eq!(err.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_collects_every_failure() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .fail_writes_to(&address("a"), RemoteError::permanent("s3:PutObject", "access denied"))
            .await;

        let changes = vec![
            change("a", EventKind::Insert, 1),
            change("a", EventKind::Modify, 2),
            change("b", EventKind::Insert, 1),
        ];

        let report = sink(store.clone()).backup(&changes, false).await;
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.written, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryObjectStore::new());
        store.throttle_next_writes(2).await;

        let report = sink(store.clone()).backup(&[change("a", EventKind::Insert, 1)], true).await;
        assert!(report.failures.is_empty());
        assert_eq!(store.versions_of(&address("a")).await.len(), 1);
    }
}
