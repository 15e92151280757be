use crate::{
    error::{AddressFailure, Result},
    model::{ChangeEvent, EventKind},
    recovery::retry_manager::{with_retry, RetryPolicy},
    source::{ChangeLogApi, CursorPosition, TableApi},
};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 默认的连续空轮询预算
pub const DEFAULT_EMPTY_POLL_BUDGET: u32 = 10;

/// 单个分片的读取状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardState {
    Start,
    Polling,
    Exhausted,
}

/// 读取全部分片的汇总结果
#[derive(Debug, Default)]
pub struct StreamReadResult {
    /// 所有成功分片的事件（分片内保持日志顺序）
    pub events: Vec<ChangeEvent>,
    /// 读取成功的分片数
    pub shards_read: usize,
    /// 读取失败的分片
    pub failures: Vec<AddressFailure>,
}

/// 变更日志分片读取器
///
/// 负责:
/// - 从最早保留位置开始逐个分片拉取变更
/// - 连续空轮询达到预算或分片关闭时停止
/// - 多个分片并发读取，单个分片失败不影响其它分片
/// - 为缺少新镜像的 INSERT/MODIFY 事件回表补全内容
pub struct ShardReader {
    change_log: Arc<dyn ChangeLogApi>,
    image_source: Option<Arc<dyn TableApi>>,
    table: String,
    retry: RetryPolicy,
    empty_poll_budget: u32,
}

impl ShardReader {
    pub fn new(change_log: Arc<dyn ChangeLogApi>, table: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            change_log,
            image_source: None,
            table: table.into(),
            retry,
            empty_poll_budget: DEFAULT_EMPTY_POLL_BUDGET,
        }
    }

    pub fn with_empty_poll_budget(mut self, budget: u32) -> Self {
        self.empty_poll_budget = budget.max(1);
        self
    }

    /// 设置用于补全新镜像的表接口
    pub fn with_image_source(mut self, table_api: Arc<dyn TableApi>) -> Self {
        self.image_source = Some(table_api);
        self
    }

    /// 并发读取表变更日志的全部分片
    pub async fn read_all(&self) -> Result<StreamReadResult> {
        let description = with_retry(&self.retry, "streams:DescribeStream", || {
            self.change_log.describe_source(&self.table)
        })
        .await?;

        info!(
            "📡 表 {} 的变更日志 {} 共有 {} 个分片",
            self.table,
            description.stream_ref,
            description.partitions.len()
        );

        let reads = description
            .partitions
            .iter()
            .map(|shard_id| self.read_shard(&description.stream_ref, shard_id));
        let outcomes = join_all(reads).await;

        let mut result = StreamReadResult::default();
        for (shard_id, outcome) in description.partitions.iter().zip(outcomes) {
            match outcome {
                Ok(events) => {
                    result.shards_read += 1;
                    result.events.extend(events);
                }
                Err(e) => {
                    warn!("❌ 分片 {} 读取失败: {}", shard_id, e);
                    result.failures.push(AddressFailure {
                        address: format!("shard:{}", shard_id),
                        error: e,
                    });
                }
            }
        }

        info!(
            "📥 读取完成: {} 个事件, {} 个分片成功, {} 个分片失败",
            result.events.len(),
            result.shards_read,
            result.failures.len()
        );
        Ok(result)
    }

    /// 从最早保留位置开始读取单个分片
    pub async fn read_shard(&self, stream_ref: &str, shard_id: &str) -> Result<Vec<ChangeEvent>> {
        let mut state = ShardState::Start;
        let mut cursor: Option<String> = None;
        let mut budget = self.empty_poll_budget;
        let mut polls = 0u32;
        let mut events = Vec::new();

        loop {
            match state {
                ShardState::Start => {
                    let start = with_retry(&self.retry, "streams:GetShardIterator", || {
                        self.change_log
                            .get_partition_cursor(stream_ref, shard_id, CursorPosition::TrimHorizon)
                    })
                    .await?;
                    cursor = Some(start);
                    state = ShardState::Polling;
                }
                ShardState::Polling => {
                    let Some(current) = cursor.take() else {
                        state = ShardState::Exhausted;
                        continue;
                    };

                    let page = with_retry(&self.retry, "streams:GetRecords", || self.change_log.poll(&current)).await?;
                    polls += 1;

                    if page.events.is_empty() {
                        budget -= 1;
                        debug!("📭 分片 {} 空轮询，剩余预算 {}", shard_id, budget);
                    } else {
                        budget = self.empty_poll_budget;
                        debug!("📬 分片 {} 读取到 {} 个事件", shard_id, page.events.len());
                        events.extend(page.events.into_iter().map(|mut event| {
                            event.source_partition = shard_id.to_string();
                            event
                        }));
                    }

                    cursor = page.next_cursor;
                    if budget == 0 || cursor.is_none() {
                        state = ShardState::Exhausted;
                    }
                }
                ShardState::Exhausted => break,
            }
        }

        debug!("🏁 分片 {} 读取结束: {} 次轮询, {} 个事件", shard_id, polls, events.len());
        self.complete_images(events).await
    }

    /// 为没有新镜像的 INSERT/MODIFY 事件读取当前记录
    async fn complete_images(&self, events: Vec<ChangeEvent>) -> Result<Vec<ChangeEvent>> {
        let Some(table_api) = &self.image_source else {
            return Ok(events);
        };

        let mut completed = Vec::with_capacity(events.len());
        for mut event in events {
            if event.kind != EventKind::Remove && event.new_image.is_none() {
                let keys = event.keys.clone();
                let item = with_retry(&self.retry, "dynamodb:GetItem", || table_api.get_item(&self.table, &keys)).await?;
                match item {
                    Some(item) => event.new_image = Some(item),
                    None => {
                        warn!("⚠️ {} 事件对应的记录已不存在，跳过: {:?}", event.kind.as_str(), event.keys);
                        continue;
                    }
                }
            }
            completed.push(event);
        }
        Ok(completed)
    }
}
