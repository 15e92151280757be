pub mod shard_reader;
pub mod snapshot_scanner;

pub use shard_reader::ShardReader;
pub use snapshot_scanner::SnapshotScanner;

use crate::{
    error::Result,
    model::{ChangeEvent, Item, KeyMap, WriteOp},
};
use async_trait::async_trait;

/// 变更日志的起始读取位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    /// 分片中最早仍被保留的位置
    TrimHorizon,
    /// 分片最新位置
    Latest,
}

/// 变更日志描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescription {
    /// 变更日志标识（例如流的ARN）
    pub stream_ref: String,
    /// 分片ID列表
    pub partitions: Vec<String>,
}

/// 一次轮询的结果
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub events: Vec<ChangeEvent>,
    /// 下一次轮询的游标，为空表示分片已关闭
    pub next_cursor: Option<String>,
}

/// 一页扫描结果
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    /// 下一页的起始键，为空表示扫描结束
    pub next_token: Option<KeyMap>,
}

/// 按分片组织的变更日志读取接口
#[async_trait]
pub trait ChangeLogApi: Send + Sync {
    /// 获取表对应的变更日志及其全部分片
    async fn describe_source(&self, table: &str) -> Result<SourceDescription>;

    /// 获取分片在指定位置的游标
    async fn get_partition_cursor(&self, stream_ref: &str, partition_id: &str, position: CursorPosition) -> Result<String>;

    /// 从游标处读取一批事件
    async fn poll(&self, cursor: &str) -> Result<PollResult>;
}

/// 表读写接口
#[async_trait]
pub trait TableApi: Send + Sync {
    /// 表的主键属性名（按主键结构顺序）
    async fn describe_key_schema(&self, table: &str) -> Result<Vec<String>>;

    /// 读取一页全表扫描结果
    async fn scan_page(&self, table: &str, page_size: usize, start: Option<KeyMap>) -> Result<ScanPage>;

    /// 按主键读取当前记录
    async fn get_item(&self, table: &str, keys: &KeyMap) -> Result<Option<Item>>;

    /// 批量写入，返回未被处理的操作
    async fn batch_write(&self, table: &str, ops: Vec<WriteOp>) -> Result<Vec<WriteOp>>;
}
