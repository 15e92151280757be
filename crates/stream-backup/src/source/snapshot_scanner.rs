use crate::{
    error::{AddressFailure, BackupError, Result},
    model::{project_keys, ChangeEvent},
    persistence::backup_sink::{BackupSink, SinkReport},
    recovery::retry_manager::{with_retry, RetryPolicy},
    source::TableApi,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 默认扫描页大小
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 25;

/// 全表扫描汇总
#[derive(Debug, Default)]
pub struct ScanSummary {
    pub pages: usize,
    pub items: usize,
    pub sink: SinkReport,
}

/// 全表快照扫描器
///
/// 逐页扫描整张表，把每条记录转换为 INSERT 事件，
/// 每页写入备份后才请求下一页，内存中最多只保留一页数据。
pub struct SnapshotScanner {
    table_api: Arc<dyn TableApi>,
    table: String,
    page_size: usize,
    retry: RetryPolicy,
}

impl SnapshotScanner {
    pub fn new(table_api: Arc<dyn TableApi>, table: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            table_api,
            table: table.into(),
            page_size: DEFAULT_SCAN_PAGE_SIZE,
            retry,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// 扫描全表并写入备份
    ///
    /// 读取页失败时立即中止，已经写入的页保持不变。
    pub async fn scan_into(&self, sink: &BackupSink) -> Result<ScanSummary> {
        let key_schema = with_retry(&self.retry, "dynamodb:DescribeTable", || {
            self.table_api.describe_key_schema(&self.table)
        })
        .await?;
        info!("🔑 表 {} 主键结构: {:?}", self.table, key_schema);

        let mut summary = ScanSummary::default();
        let mut start = None;

        loop {
            let fetched = with_retry(&self.retry, "dynamodb:Scan", || {
                self.table_api.scan_page(&self.table, self.page_size, start.clone())
            })
            .await;
            let page = match fetched {
                Ok(page) => page,
                Err(e) if summary.sink.failures.is_empty() => return Err(e),
                Err(e) => {
                    // 之前页的写入失败与本次读取失败一并返回
                    let mut failures = std::mem::take(&mut summary.sink.failures);
                    failures.push(AddressFailure {
                        address: format!("{}:page-{}", self.table, summary.pages + 1),
                        error: e,
                    });
                    return Err(BackupError::Partial {
                        operation: "capture_full".to_string(),
                        failures,
                    });
                }
            };

            summary.pages += 1;
            summary.items += page.items.len();

            let mut events = Vec::with_capacity(page.items.len());
            for item in page.items {
                match project_keys(&item, &key_schema) {
                    Some(keys) => events.push(ChangeEvent::snapshot(keys, item)),
                    None => {
                        warn!("⚠️ 扫描到缺少主键属性的记录，跳过");
                        summary.sink.failures.push(AddressFailure {
                            address: format!("{}:page-{}", self.table, summary.pages),
                            error: BackupError::MissingKeyAttribute {
                                address: self.table.clone(),
                                attribute: key_schema.join(","),
                            },
                        });
                    }
                }
            }

            let report = sink.backup(&events, false).await;
            summary.sink.merge(report);

            info!(
                "📄 已读取 {} 条记录; 共 {} 条记录",
                events.len(),
                summary.items
            );

            match page.next_token {
                Some(token) => {
                    debug!("➡️ 继续扫描下一页");
                    start = Some(token);
                }
                None => break,
            }
        }

        info!(
            "✅ 全表扫描完成: {} 页, {} 条记录, {} 个失败",
            summary.pages,
            summary.items,
            summary.sink.failures.len()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::memory::{MemoryObjectStore, MemoryTable},
        error::RemoteError,
        model::{AttributeValue, Item},
        persistence::object_store::PutOptions,
    };
    use std::time::Duration;

    fn item(id: u32) -> Item {
        let mut item = Item::new();
        item.insert("id".to_string(), AttributeValue::N(id.to_string()));
        item.insert("name".to_string(), AttributeValue::S(format!("user-{}", id)));
        item
    }

    fn retry() -> RetryPolicy {
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_scans_every_page_and_flushes_each() {
        let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
        for id in 0..7 {
            table.insert(item(id)).await;
        }
        let store = Arc::new(MemoryObjectStore::new());
        let sink = BackupSink::new(store.clone(), "backups/users", PutOptions::default(), retry());

        let scanner = SnapshotScanner::new(table.clone(), "users", retry()).with_page_size(3);
        let summary = scanner.scan_into(&sink).await.unwrap();

        assert_eq!(summary.pages, 3);
        assert_eq!(summary.items, 7);
        assert_eq!(summary.sink.written, 7);
        assert!(summary.sink.failures.is_empty());
        assert_eq!(store.version_count().await, 7);
        assert_eq!(table.scan_requests().await, vec![3, 3, 3]);
    }

    #[tokio::test]
    async fn test_page_failure_aborts_but_keeps_flushed_pages() {
        let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
        for id in 0..6 {
            table.insert(item(id)).await;
        }
        table
            .fail_scan_after(1, RemoteError::permanent("dynamodb:Scan", "access denied"))
            .await;

        let store = Arc::new(MemoryObjectStore::new());
        let sink = BackupSink::new(store.clone(), "backups/users", PutOptions::default(), retry());

        let scanner = SnapshotScanner::new(table, "users", retry()).with_page_size(2);
        let err = scanner.scan_into(&sink).await.unwrap_err();

        assert!(matches!(err, BackupError::Remote(_)));
        assert_eq!(store.version_count().await, 2);
    }

    #[tokio::test]
    async fn test_page_failure_keeps_earlier_write_failures() {
        use crate::model::{content_address, project_keys, serialize_keys};

        let table = Arc::new(MemoryTable::new(vec!["id".to_string()]));
        for id in 0..6 {
            table.insert(item(id)).await;
        }
        table
            .fail_scan_after(1, RemoteError::permanent("dynamodb:Scan", "access denied"))
            .await;

        let store = Arc::new(MemoryObjectStore::new());
        let keys = project_keys(&item(0), &["id".to_string()]).unwrap();
        let broken = content_address("backups/users", &serialize_keys(&keys).unwrap());
        store
            .fail_writes_to(&broken, RemoteError::permanent("s3:PutObject", "access denied"))
            .await;
        let sink = BackupSink::new(store.clone(), "backups/users", PutOptions::default(), retry());

        let scanner = SnapshotScanner::new(table, "users", retry()).with_page_size(2);
        let err = scanner.scan_into(&sink).await.unwrap_err();

        let addresses: Vec<_> = err.failures().iter().map(|f| f.address.clone()).collect();
        assert_eq!(addresses, vec![broken, "users:page-2".to_string()]);
        assert_eq!(store.version_count().await, 1);
    }
}
