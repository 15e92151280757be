use crate::{
    config::MAX_BATCH_WRITE_ITEMS,
    error::{AddressFailure, BackupError, RemoteError, Result},
    model::{parse_item, project_keys, ReconciledEntry, WriteOp},
    persistence::object_store::ObjectStore,
    recovery::retry_manager::{with_retry, RetryPolicy},
    source::TableApi,
};
use futures::{stream, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 默认并发提交的批次数
pub const DEFAULT_RESTORE_CONCURRENCY: usize = 4;

/// 写回统计
#[derive(Debug, Default)]
pub struct RestoreStats {
    pub puts: usize,
    pub deletes: usize,
    /// 因只有删除标记而跳过的地址数
    pub gaps_skipped: usize,
    pub failures: Vec<AddressFailure>,
}

impl RestoreStats {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// 已准备好的一条写回操作
#[derive(Debug, Clone)]
struct PreparedOp {
    address: String,
    op: WriteOp,
}

/// 一个批次的写入结果
#[derive(Debug, Default)]
struct BatchOutcome {
    applied: Vec<PreparedOp>,
    failures: Vec<AddressFailure>,
}

/// 把对账结果写回表
///
/// 先读取每个条目对应的版本内容并转换为写操作，
/// 再按批次（不超过单次请求上限）并发写入。
pub struct RestoreApplier {
    store: Arc<dyn ObjectStore>,
    table_api: Arc<dyn TableApi>,
    table: String,
    retry: RetryPolicy,
    batch_size: usize,
    concurrency: usize,
}

impl RestoreApplier {
    pub fn new(store: Arc<dyn ObjectStore>, table_api: Arc<dyn TableApi>, table: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            table_api,
            table: table.into(),
            retry,
            batch_size: MAX_BATCH_WRITE_ITEMS,
            concurrency: DEFAULT_RESTORE_CONCURRENCY,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_WRITE_ITEMS);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// 写回全部条目
    ///
    /// 单个条目或批次的失败记录在统计中，不影响其它条目。
    pub async fn apply(&self, entries: &[ReconciledEntry]) -> Result<RestoreStats> {
        let key_schema = with_retry(&self.retry, "dynamodb:DescribeTable", || {
            self.table_api.describe_key_schema(&self.table)
        })
        .await?;
        debug!("🔑 目标表 {} 主键结构: {:?}", self.table, key_schema);

        let mut stats = RestoreStats::default();

        let prepared = stream::iter(entries)
            .map(|entry| self.prepare(entry, &key_schema))
            .buffered(self.concurrency.max(1) * MAX_BATCH_WRITE_ITEMS)
            .collect::<Vec<_>>()
            .await;

        let mut ops = Vec::with_capacity(prepared.len());
        for (entry, outcome) in entries.iter().zip(prepared) {
            match outcome {
                Ok(op) => ops.push(op),
                Err(e) => {
                    error!("❌ 读取版本 {} ({}) 失败: {}", entry.key, entry.version_id, e);
                    stats.failures.push(AddressFailure {
                        address: entry.key.clone(),
                        error: e,
                    });
                }
            }
        }

        let batches: Vec<Vec<PreparedOp>> = ops.chunks(self.batch_size).map(<[PreparedOp]>::to_vec).collect();
        info!(
            "📦 准备写回 {} 条操作，共 {} 个批次 (批次大小 {}, 并发 {})",
            ops.len(),
            batches.len(),
            self.batch_size,
            self.concurrency
        );

        let outcomes = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| self.apply_batch(index, batch))
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        for outcome in outcomes {
            for prepared in &outcome.applied {
                match prepared.op {
                    WriteOp::Put(_) => stats.puts += 1,
                    WriteOp::Delete(_) => stats.deletes += 1,
                }
            }
            stats.failures.extend(outcome.failures);
        }

        info!(
            "✅ 写回完成: {} 次写入, {} 次删除, {} 个失败",
            stats.puts,
            stats.deletes,
            stats.failed()
        );
        Ok(stats)
    }

    /// 读取条目对应的版本内容并转换为写操作
    async fn prepare(&self, entry: &ReconciledEntry, key_schema: &[String]) -> Result<PreparedOp> {
        let body = with_retry(&self.retry, "s3:GetObject", || {
            self.store.get_version(&entry.key, &entry.version_id)
        })
        .await?;
        let item = parse_item(&body)?;

        let op = if entry.deleted_at_target {
            let keys = project_keys(&item, key_schema).ok_or_else(|| {
                let attribute = key_schema
                    .iter()
                    .find(|name| !item.contains_key(*name))
                    .cloned()
                    .unwrap_or_default();
                BackupError::MissingKeyAttribute {
                    address: entry.key.clone(),
                    attribute,
                }
            })?;
            WriteOp::Delete(keys)
        } else {
            WriteOp::Put(item)
        };

        Ok(PreparedOp {
            address: entry.key.clone(),
            op,
        })
    }

    /// 写入一个批次
    ///
    /// 批次整体失败时逐条重新提交，只有真正被拒绝的条目记为失败。
    async fn apply_batch(&self, index: usize, batch: Vec<PreparedOp>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        let error = match self.submit_batch(index, &batch).await {
            Ok(()) => {
                outcome.applied = batch;
                return outcome;
            }
            Err(e) => e,
        };

        if batch.len() == 1 {
            error!("❌ 批次 {} 写入失败: {}", index, error);
            outcome.failures.extend(batch.into_iter().next().map(|p| AddressFailure {
                address: p.address,
                error,
            }));
            return outcome;
        }

        warn!("⚠️ 批次 {} 写入失败，逐条重新提交 ({} 条): {}", index, batch.len(), error);
        for prepared in batch {
            match self.submit_batch(index, std::slice::from_ref(&prepared)).await {
                Ok(()) => outcome.applied.push(prepared),
                Err(e) => {
                    error!("❌ 地址 {} 写入失败: {}", prepared.address, e);
                    outcome.failures.push(AddressFailure {
                        address: prepared.address,
                        error: e,
                    });
                }
            }
        }
        outcome
    }

    /// 提交一个批次，未处理的操作按限流错误重试
    async fn submit_batch(&self, index: usize, batch: &[PreparedOp]) -> Result<()> {
        let pending = Arc::new(Mutex::new(batch.iter().map(|p| p.op.clone()).collect::<Vec<_>>()));

        with_retry(&self.retry, "dynamodb:BatchWriteItem", || {
            let pending = Arc::clone(&pending);
            async move {
                let ops = pending.lock().await.clone();
                let unprocessed = self.table_api.batch_write(&self.table, ops).await?;
                let remaining = unprocessed.len();
                *pending.lock().await = unprocessed;

                if remaining > 0 {
                    warn!("⏳ 批次 {} 有 {} 条操作未被处理，准备重新提交", index, remaining);
                    return Err(RemoteError::throttled(
                        "dynamodb:BatchWriteItem",
                        format!("{} unprocessed items", remaining),
                    )
                    .into());
                }
                Ok(())
            }
        })
        .await?;

        debug!("📝 批次 {} 写入完成 ({} 条)", index, batch.len());
        Ok(())
    }
}
