pub mod backends;
pub mod config;
pub mod error;
pub mod model;
pub mod persistence;
pub mod recovery;
pub mod restore;
pub mod source;

#[cfg(test)]
pub mod tests;

pub use error::{BackupError, Result};

use crate::{
    config::{CaptureConfig, RestoreConfig},
    error::AddressFailure,
    model::ChangeEvent,
    persistence::{BackupSink, ObjectStore, SinkReport},
    restore::{list_all_versions, reconcile, RestoreApplier, RestoreStats},
    source::{ChangeLogApi, ShardReader, SnapshotScanner, TableApi},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 一次捕获的统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureStats {
    /// 读取或接收到的变更事件数
    pub events: usize,
    /// 读取成功的分片数（全量捕获为0）
    pub shards_read: usize,
    /// 全量扫描读取的页数
    pub pages: usize,
    /// 写入的内容版本数
    pub written: usize,
    /// 写入的删除标记数
    pub tombstones: usize,
}

impl CaptureStats {
    fn absorb(&mut self, report: &SinkReport) {
        self.written += report.written;
        self.tombstones += report.tombstones;
    }
}

fn finish<T>(operation: &str, value: T, failures: Vec<AddressFailure>) -> Result<T> {
    if failures.is_empty() {
        return Ok(value);
    }
    for failure in &failures {
        error!("❌ {}: {}", operation, failure);
    }
    Err(BackupError::Partial {
        operation: operation.to_string(),
        failures,
    })
}

/// Stream-Backup 捕获服务
///
/// 负责:
/// - 增量捕获: 读取表变更日志的全部分片，按主键顺序写入备份
/// - 全量捕获: 分页扫描整张表，每条记录写入一个新版本
/// - 推送捕获: 处理由变更流触发器推送过来的事件
///
/// 任何地址或分片失败都不会影响其它地址，所有失败最终汇总为
/// [`BackupError::Partial`] 返回。
#[derive(Clone)]
pub struct StreamBackupService {
    config: Arc<CaptureConfig>,
    change_log: Arc<dyn ChangeLogApi>,
    table_api: Arc<dyn TableApi>,
    sink: Arc<BackupSink>,
}

impl StreamBackupService {
    /// 创建捕获服务实例
    pub fn new(
        config: CaptureConfig,
        change_log: Arc<dyn ChangeLogApi>,
        table_api: Arc<dyn TableApi>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        let sink = Arc::new(BackupSink::new(
            store,
            config.sink.prefix.clone(),
            config.sink.put_options(),
            config.retry.policy(),
        ));

        info!(
            "🚀 初始化捕获服务: 表 {} -> s3://{}/{}",
            config.source.table, config.sink.bucket, config.sink.prefix
        );

        Self {
            config: Arc::new(config),
            change_log,
            table_api,
            sink,
        }
    }

    /// 增量捕获：从变更日志的最早保留位置读取全部分片并写入备份
    pub async fn capture_incremental(&self) -> Result<CaptureStats> {
        self.config.validate()?;
        info!("📡 开始增量捕获: {}", self.config.source.table);

        let reader = ShardReader::new(
            Arc::clone(&self.change_log),
            self.config.source.table.clone(),
            self.config.retry.policy(),
        )
        .with_empty_poll_budget(self.config.empty_poll_budget)
        .with_image_source(Arc::clone(&self.table_api));

        let read = reader.read_all().await?;
        let report = self.sink.backup(&read.events, true).await;

        let mut stats = CaptureStats {
            events: read.events.len(),
            shards_read: read.shards_read,
            ..Default::default()
        };
        stats.absorb(&report);

        let mut failures = read.failures;
        failures.extend(report.failures);

        info!(
            "✅ 增量捕获完成: {} 个事件, {} 个版本, {} 个删除标记, {} 个失败",
            stats.events,
            stats.written,
            stats.tombstones,
            failures.len()
        );
        finish("capture_incremental", stats, failures)
    }

    /// 全量捕获：分页扫描整张表，每页写入后再读取下一页
    pub async fn capture_full(&self) -> Result<CaptureStats> {
        self.config.validate()?;
        info!("🔍 开始全量捕获: {}", self.config.source.table);

        let scanner = SnapshotScanner::new(
            Arc::clone(&self.table_api),
            self.config.source.table.clone(),
            self.config.retry.policy(),
        )
        .with_page_size(self.config.scan_page_size);

        let summary = scanner.scan_into(&self.sink).await?;

        let mut stats = CaptureStats {
            events: summary.items,
            pages: summary.pages,
            ..Default::default()
        };
        stats.absorb(&summary.sink);

        info!(
            "✅ 全量捕获完成: {} 页, {} 条记录, {} 个失败",
            stats.pages,
            stats.events,
            summary.sink.failures.len()
        );
        finish("capture_full", stats, summary.sink.failures)
    }

    /// 处理变更流触发器推送的一批事件
    pub async fn backup_stream_events(&self, events: Vec<ChangeEvent>) -> Result<CaptureStats> {
        if events.is_empty() {
            warn!("⚠️ 收到空的事件批次");
            return Ok(CaptureStats::default());
        }
        info!("📨 收到 {} 个推送事件", events.len());

        let report = self.sink.backup(&events, true).await;
        let mut stats = CaptureStats {
            events: events.len(),
            ..Default::default()
        };
        stats.absorb(&report);

        finish("backup_stream_events", stats, report.failures)
    }
}

/// 时间点恢复
///
/// 列出备份前缀下的全部版本，归约到目标时间点，再写回目标表。
#[derive(Clone)]
pub struct PointInTimeRestore {
    config: Arc<RestoreConfig>,
    store: Arc<dyn ObjectStore>,
    table_api: Arc<dyn TableApi>,
}

impl PointInTimeRestore {
    pub fn new(config: RestoreConfig, store: Arc<dyn ObjectStore>, table_api: Arc<dyn TableApi>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            table_api,
        }
    }

    /// 恢复到配置中的时间点（未配置则为最新状态）
    pub async fn restore(&self) -> Result<RestoreStats> {
        self.restore_at(self.config.restore_time).await
    }

    /// 恢复到指定时间点，`None` 表示最新状态
    pub async fn restore_at(&self, target: Option<DateTime<Utc>>) -> Result<RestoreStats> {
        self.config.validate()?;
        let prefix = &self.config.sink.prefix;
        let retry = self.config.retry.policy();
        match target {
            Some(time) => info!("⏪ 开始恢复 {} 到 {}", self.config.target.table, time.to_rfc3339()),
            None => info!("⏪ 开始恢复 {} 到最新状态", self.config.target.table),
        }

        let records = list_all_versions(self.store.as_ref(), prefix, &retry).await?;
        let reconciliation = reconcile(&records, target, prefix);
        info!(
            "🧾 对账完成: {} 个地址待写回, {} 个地址无法重建",
            reconciliation.entries.len(),
            reconciliation.gaps.len()
        );

        let applier = RestoreApplier::new(
            Arc::clone(&self.store),
            Arc::clone(&self.table_api),
            self.config.target.table.clone(),
            retry,
        )
        .with_batch_size(self.config.batch_size)
        .with_concurrency(self.config.concurrency);

        let mut stats = applier.apply(&reconciliation.entries).await?;
        stats.gaps_skipped = reconciliation.gaps.len();

        let failures = std::mem::take(&mut stats.failures);
        finish("restore", stats, failures)
    }
}
