//! 进程内后端
//!
//! 变更日志、表和带版本控制的对象存储的内存实现。时钟与版本ID都是确定性的：
//! 每次写入时钟前进1毫秒，版本ID为补零的递增序号，因此同一地址的版本
//! 按写入顺序严格递增。另外提供了故障注入，用于模拟限流与永久错误。

use crate::{
    error::{RemoteError, RemoteErrorKind, Result},
    model::{project_keys, serialize_keys, ChangeEvent, Item, KeyMap, VersionRecord, WriteOp},
    persistence::object_store::{ObjectStore, PutOptions, VersionPage, VersionPageToken},
    source::{ChangeLogApi, CursorPosition, PollResult, ScanPage, SourceDescription, TableApi},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, warn};

// ============================================================================
// 变更日志
// ============================================================================

#[derive(Debug, Default)]
struct ShardLog {
    pages: Vec<Vec<ChangeEvent>>,
    /// 为真时读完所有页后分片保持打开，继续返回空页
    stay_open: bool,
    failure: Option<RemoteError>,
}

#[derive(Debug, Default)]
struct ChangeLogState {
    /// 按加入顺序保存的分片
    shards: Vec<(String, ShardLog)>,
    polls: usize,
}

impl ChangeLogState {
    fn shard(&self, shard_id: &str) -> Option<&ShardLog> {
        self.shards.iter().find(|(id, _)| id == shard_id).map(|(_, log)| log)
    }
}

/// 内存变更日志，每个分片由预先放入的若干页组成
pub struct MemoryChangeLog {
    table: String,
    state: Mutex<ChangeLogState>,
}

impl MemoryChangeLog {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            state: Mutex::new(ChangeLogState::default()),
        }
    }

    /// 设置分片内容，每次轮询返回一页
    pub async fn push_pages(&self, shard_id: &str, pages: Vec<Vec<ChangeEvent>>, stay_open: bool) {
        let mut state = self.state.lock().await;
        let log = ShardLog {
            pages,
            stay_open,
            failure: None,
        };
        match state.shards.iter_mut().find(|(id, _)| id == shard_id) {
            Some((_, existing)) => *existing = log,
            None => state.shards.push((shard_id.to_string(), log)),
        }
    }

    /// 之后对该分片的轮询都返回指定错误
    pub async fn fail_shard(&self, shard_id: &str, error: RemoteError) {
        let mut state = self.state.lock().await;
        if let Some((_, log)) = state.shards.iter_mut().find(|(id, _)| id == shard_id) {
            log.failure = Some(error);
        }
    }

    pub async fn poll_count(&self) -> usize {
        self.state.lock().await.polls
    }

    fn parse_cursor(cursor: &str) -> Result<(&str, usize)> {
        cursor
            .rsplit_once('#')
            .and_then(|(shard, index)| index.parse().ok().map(|index| (shard, index)))
            .ok_or_else(|| RemoteError::permanent("streams:GetRecords", format!("invalid iterator: {}", cursor)).into())
    }
}

#[async_trait]
impl ChangeLogApi for MemoryChangeLog {
    async fn describe_source(&self, table: &str) -> Result<SourceDescription> {
        if table != self.table {
            return Err(RemoteError::permanent("streams:DescribeStream", format!("no stream for table {}", table))
                .with_code("ResourceNotFoundException")
                .into());
        }
        let state = self.state.lock().await;
        Ok(SourceDescription {
            stream_ref: format!("stream/{}", self.table),
            partitions: state.shards.iter().map(|(id, _)| id.clone()).collect(),
        })
    }

    async fn get_partition_cursor(&self, _stream_ref: &str, partition_id: &str, position: CursorPosition) -> Result<String> {
        let state = self.state.lock().await;
        let log = state.shard(partition_id).ok_or_else(|| {
            RemoteError::permanent("streams:GetShardIterator", format!("unknown shard {}", partition_id))
                .with_code("ResourceNotFoundException")
        })?;
        let index = match position {
            CursorPosition::TrimHorizon => 0,
            CursorPosition::Latest => log.pages.len(),
        };
        Ok(format!("{}#{}", partition_id, index))
    }

    async fn poll(&self, cursor: &str) -> Result<PollResult> {
        let (shard_id, index) = Self::parse_cursor(cursor)?;
        let mut state = self.state.lock().await;
        state.polls += 1;

        let log = state.shard(shard_id).ok_or_else(|| {
            RemoteError::permanent("streams:GetRecords", format!("unknown shard {}", shard_id))
                .with_code("ResourceNotFoundException")
        })?;
        if let Some(failure) = &log.failure {
            return Err(failure.clone().into());
        }

        let events = log.pages.get(index).cloned().unwrap_or_default();
        let has_more = index + 1 < log.pages.len() || log.stay_open;
        Ok(PollResult {
            events,
            next_cursor: has_more.then(|| format!("{}#{}", shard_id, index + 1)),
        })
    }
}

// ============================================================================
// 表
// ============================================================================

#[derive(Debug, Default)]
struct TableState {
    /// 序列化主键 -> 记录
    items: BTreeMap<String, Item>,
    batch_sizes: Vec<usize>,
    scan_requests: Vec<usize>,
    scans_served: usize,
    /// (每次未处理的条数, 剩余次数)
    unprocessed: Option<(usize, u32)>,
    /// 成功返回指定页数之后扫描失败
    scan_failure: Option<(usize, RemoteError)>,
}

/// 内存表，记录按序列化主键排序
pub struct MemoryTable {
    key_schema: Vec<String>,
    state: Mutex<TableState>,
}

impl MemoryTable {
    pub fn new(key_schema: Vec<String>) -> Self {
        Self {
            key_schema,
            state: Mutex::new(TableState::default()),
        }
    }

    fn address(&self, keys: &KeyMap) -> Result<String> {
        serialize_keys(keys)
    }

    /// 写入或替换一条记录
    pub async fn insert(&self, item: Item) {
        let Some(keys) = project_keys(&item, &self.key_schema) else {
            warn!("⚠️ 记录缺少主键属性，忽略: {:?}", item);
            return;
        };
        match self.address(&keys) {
            Ok(address) => {
                self.state.lock().await.items.insert(address, item);
            }
            Err(e) => warn!("⚠️ 主键序列化失败: {}", e),
        }
    }

    /// 当前全部记录（按主键排序）
    pub async fn items(&self) -> Vec<Item> {
        self.state.lock().await.items.values().cloned().collect()
    }

    /// 每次批量写入提交的操作数
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().await.batch_sizes.clone()
    }

    /// 每次扫描请求的页大小
    pub async fn scan_requests(&self) -> Vec<usize> {
        self.state.lock().await.scan_requests.clone()
    }

    /// 接下来 `times` 次批量写入各留下 `count` 条未处理
    pub async fn leave_unprocessed(&self, count: usize, times: u32) {
        self.state.lock().await.unprocessed = Some((count, times));
    }

    /// 成功返回 `pages` 页之后，扫描返回指定错误
    pub async fn fail_scan_after(&self, pages: usize, error: RemoteError) {
        self.state.lock().await.scan_failure = Some((pages, error));
    }
}

#[async_trait]
impl TableApi for MemoryTable {
    async fn describe_key_schema(&self, _table: &str) -> Result<Vec<String>> {
        Ok(self.key_schema.clone())
    }

    async fn scan_page(&self, _table: &str, page_size: usize, start: Option<KeyMap>) -> Result<ScanPage> {
        let start = start.as_ref().map(|keys| self.address(keys)).transpose()?;
        let mut state = self.state.lock().await;
        state.scan_requests.push(page_size);

        if let Some((after, error)) = &state.scan_failure {
            if state.scans_served >= *after {
                return Err(error.clone().into());
            }
        }
        state.scans_served += 1;

        let mut remaining = state
            .items
            .iter()
            .filter(|(address, _)| start.as_ref().map_or(true, |start| address.as_str() > start.as_str()));
        let items: Vec<Item> = remaining.by_ref().take(page_size).map(|(_, item)| item.clone()).collect();
        let has_more = remaining.next().is_some();

        let next_token = match items.last() {
            Some(last) if has_more => project_keys(last, &self.key_schema),
            _ => None,
        };
        debug!("🔍 内存表扫描: {} 条, 还有更多: {}", items.len(), has_more);
        Ok(ScanPage { items, next_token })
    }

    async fn get_item(&self, _table: &str, keys: &KeyMap) -> Result<Option<Item>> {
        let address = self.address(keys)?;
        Ok(self.state.lock().await.items.get(&address).cloned())
    }

    async fn batch_write(&self, _table: &str, mut ops: Vec<WriteOp>) -> Result<Vec<WriteOp>> {
        let mut state = self.state.lock().await;
        state.batch_sizes.push(ops.len());

        let mut unprocessed = Vec::new();
        if let Some((count, times)) = state.unprocessed {
            if times > 0 {
                let split = ops.len().saturating_sub(count);
                unprocessed = ops.split_off(split);
                state.unprocessed = Some((count, times - 1));
            }
        }

        // 整批校验通过后才写入，任何一条被拒绝则整批不生效
        let mut validated = Vec::with_capacity(ops.len());
        for op in ops {
            let keys = match &op {
                WriteOp::Put(item) => project_keys(item, &self.key_schema).ok_or_else(|| {
                    RemoteError::permanent("dynamodb:BatchWriteItem", "item is missing key attributes")
                        .with_code("ValidationException")
                })?,
                WriteOp::Delete(keys) => keys.clone(),
            };
            validated.push((self.address(&keys)?, op));
        }

        for (address, op) in validated {
            match op {
                WriteOp::Put(item) => {
                    state.items.insert(address, item);
                }
                WriteOp::Delete(_) => {
                    state.items.remove(&address);
                }
            }
        }
        Ok(unprocessed)
    }
}

// ============================================================================
// 对象存储
// ============================================================================

#[derive(Debug, Clone)]
struct StoredVersion {
    record: VersionRecord,
    body: Option<Vec<u8>>,
    options: Option<PutOptions>,
}

#[derive(Debug)]
struct StoreState {
    /// 按写入顺序保存的全部版本
    versions: Vec<StoredVersion>,
    next_version: u64,
    clock: DateTime<Utc>,
    failing: HashMap<String, RemoteError>,
    throttle_remaining: u32,
    list_calls: usize,
}

/// 带版本控制的内存对象存储
pub struct MemoryObjectStore {
    state: Mutex<StoreState>,
    page_size: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        let clock = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            state: Mutex::new(StoreState {
                versions: Vec::new(),
                next_version: 1,
                clock,
                failing: HashMap::new(),
                throttle_remaining: 0,
                list_calls: 0,
            }),
            page_size: 1000,
        }
    }

    /// 设置版本列表每页条数
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// 当前时钟
    pub async fn now(&self) -> DateTime<Utc> {
        self.state.lock().await.clock
    }

    /// 手动推进时钟
    pub async fn advance_clock(&self, by: std::time::Duration) {
        let by = Duration::from_std(by).unwrap_or_else(|_| Duration::zero());
        let mut state = self.state.lock().await;
        state.clock += by;
    }

    /// 之后对该地址的写入和删除都返回指定错误
    pub async fn fail_writes_to(&self, key: &str, error: RemoteError) {
        self.state.lock().await.failing.insert(key.to_string(), error);
    }

    /// 接下来的 `count` 次写入或删除返回限流错误
    pub async fn throttle_next_writes(&self, count: u32) {
        self.state.lock().await.throttle_remaining = count;
    }

    /// 某个地址的全部版本（按写入顺序）
    pub async fn versions_of(&self, key: &str) -> Vec<VersionRecord> {
        let state = self.state.lock().await;
        state
            .versions
            .iter()
            .filter(|v| v.record.key == key)
            .map(|v| v.record.clone())
            .collect()
    }

    /// 某个地址每次写入内容时使用的参数
    pub async fn put_options_of(&self, key: &str) -> Vec<PutOptions> {
        let state = self.state.lock().await;
        state
            .versions
            .iter()
            .filter(|v| v.record.key == key)
            .filter_map(|v| v.options.clone())
            .collect()
    }

    /// 所有版本数（含删除标记）
    pub async fn version_count(&self) -> usize {
        self.state.lock().await.versions.len()
    }

    /// 每个地址最新版本的内容（最新版本为删除标记的地址不包含在内）
    pub async fn latest_bodies(&self) -> BTreeMap<String, Vec<u8>> {
        let state = self.state.lock().await;
        let mut latest: BTreeMap<String, Option<Vec<u8>>> = BTreeMap::new();
        for version in &state.versions {
            latest.insert(version.record.key.clone(), version.body.clone());
        }
        latest
            .into_iter()
            .filter_map(|(key, body)| body.map(|body| (key, body)))
            .collect()
    }

    /// 写入一个没有内容的占位对象（例如前缀本身）
    pub async fn put_placeholder(&self, key: &str) {
        let mut state = self.state.lock().await;
        Self::append(&mut state, key, Some(Vec::new()), None);
    }

    pub async fn list_calls(&self) -> usize {
        self.state.lock().await.list_calls
    }

    fn check_write(state: &mut StoreState, operation: &str, key: &str) -> Result<()> {
        if state.throttle_remaining > 0 {
            state.throttle_remaining -= 1;
            return Err(RemoteError::throttled(operation, "Please reduce your request rate.")
                .with_status(503)
                .into());
        }
        if let Some(error) = state.failing.get(key) {
            return Err(error.clone().into());
        }
        Ok(())
    }

    fn append(state: &mut StoreState, key: &str, body: Option<Vec<u8>>, options: Option<PutOptions>) {
        state.clock += Duration::milliseconds(1);
        let version_id = format!("{:020}", state.next_version);
        state.next_version += 1;

        let record = VersionRecord {
            key: key.to_string(),
            version_id,
            last_modified: state.clock,
            is_tombstone: body.is_none(),
            size: body.as_ref().map(|b| b.len() as u64),
        };
        state.versions.push(StoredVersion { record, body, options });
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, options: &PutOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_write(&mut state, "s3:PutObject", key)?;
        Self::append(&mut state, key, Some(body), Some(options.clone()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check_write(&mut state, "s3:DeleteObject", key)?;
        Self::append(&mut state, key, None, None);
        Ok(())
    }

    async fn list_versions(&self, prefix: &str, page: Option<VersionPageToken>) -> Result<VersionPage> {
        let mut state = self.state.lock().await;
        state.list_calls += 1;

        // 与对象存储一致：按地址升序，同一地址内最新的版本在前
        let mut records: Vec<&VersionRecord> = state
            .versions
            .iter()
            .map(|v| &v.record)
            .filter(|r| r.key.starts_with(prefix))
            .collect();
        records.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then_with(|| b.last_modified.cmp(&a.last_modified))
                .then_with(|| b.version_id.cmp(&a.version_id))
        });

        let start = match &page {
            Some(token) => records
                .iter()
                .position(|r| r.key == token.key_marker && Some(&r.version_id) == token.version_id_marker.as_ref())
                .map(|position| position + 1)
                .ok_or_else(|| {
                    RemoteError::new("s3:ListObjectVersions", RemoteErrorKind::Permanent, "invalid version marker")
                        .with_code("InvalidArgument")
                        .with_status(400)
                })?,
            None => 0,
        };

        let end = (start + self.page_size).min(records.len());
        let page_records: Vec<VersionRecord> = records[start..end].iter().map(|r| (*r).clone()).collect();
        let next = if end < records.len() {
            page_records.last().map(|last| VersionPageToken {
                key_marker: last.key.clone(),
                version_id_marker: Some(last.version_id.clone()),
            })
        } else {
            None
        };

        Ok(VersionPage {
            records: page_records,
            next,
        })
    }

    async fn get_version(&self, key: &str, version_id: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        let version = state
            .versions
            .iter()
            .find(|v| v.record.key == key && v.record.version_id == version_id)
            .ok_or_else(|| {
                RemoteError::permanent("s3:GetObject", format!("no version {} of {}", version_id, key))
                    .with_code("NoSuchVersion")
                    .with_status(404)
            })?;

        version.body.clone().ok_or_else(|| {
            RemoteError::permanent("s3:GetObject", format!("{} version {} is a delete marker", key, version_id))
                .with_code("MethodNotAllowed")
                .with_status(405)
                .into()
        })
    }
}
