//! AWS 服务适配器：S3（版本化对象存储）、DynamoDB（表）、DynamoDB Streams（变更日志）
//!
//! 客户端由显式传入的 [`TransportConfig`] 构造，SDK 自带的重试被关闭，
//! 所有重试统一由 [`crate::recovery::retry_manager`] 处理。

use crate::{
    config::TransportConfig,
    error::{BackupError, RemoteError, RemoteErrorKind, Result},
    model::{AttributeValue, Binary, ChangeEvent, EventKind, Item, KeyMap, VersionRecord, WriteOp},
    persistence::object_store::{ObjectStore, PutOptions, VersionPage, VersionPageToken},
    source::{ChangeLogApi, CursorPosition, PollResult, ScanPage, SourceDescription, TableApi},
};
use async_trait::async_trait;
use aws_config::{retry::RetryConfig as SdkRetryConfig, timeout::TimeoutConfig, BehaviorVersion, Region, SdkConfig};
use aws_sdk_dynamodb::{
    primitives::Blob,
    types::{AttributeValue as DynamoValue, DeleteRequest, PutRequest, WriteRequest},
};
use aws_sdk_dynamodbstreams::types::{AttributeValue as StreamValue, OperationType, ShardIteratorType};
use aws_sdk_s3::{
    config::http::HttpResponse,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{ServerSideEncryption, StorageClass},
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// 按区域和传输配置加载 SDK 配置
pub async fn load_sdk_config(region: &str, transport: &TransportConfig) -> SdkConfig {
    let mut timeouts = TimeoutConfig::builder();
    if let Some(timeout) = transport.connect_timeout() {
        timeouts = timeouts.connect_timeout(timeout);
    }
    if let Some(timeout) = transport.operation_timeout() {
        timeouts = timeouts.operation_timeout(timeout);
    }

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .retry_config(SdkRetryConfig::disabled())
        .timeout_config(timeouts.build());
    if let Some(endpoint) = &transport.endpoint_url {
        info!("🔌 使用自定义服务端点: {}", endpoint);
        loader = loader.endpoint_url(endpoint.clone());
    }

    loader.load().await
}

/// 将 SDK 错误转换为带分类的远程错误
fn remote_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> BackupError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    let remote = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            RemoteError::new(operation, RemoteErrorKind::Transport, message)
        }
        _ => {
            let status = err.raw_response().map(|response| response.status().as_u16());
            RemoteError::classify(operation, err.code(), status, message)
        }
    };
    remote.into()
}

fn missing_field(operation: &str, field: &str) -> BackupError {
    RemoteError::permanent(operation, format!("响应缺少字段 {}", field)).into()
}

fn to_chrono(time: &aws_sdk_s3::primitives::DateTime) -> DateTime<Utc> {
    Utc.timestamp_opt(time.secs(), time.subsec_nanos())
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ============================================================================
// 属性值转换
// ============================================================================

fn to_dynamo_value(value: &AttributeValue) -> DynamoValue {
    match value {
        AttributeValue::S(s) => DynamoValue::S(s.clone()),
        AttributeValue::N(n) => DynamoValue::N(n.clone()),
        AttributeValue::B(b) => DynamoValue::B(Blob::new(b.0.clone())),
        AttributeValue::SS(values) => DynamoValue::Ss(values.clone()),
        AttributeValue::NS(values) => DynamoValue::Ns(values.clone()),
        AttributeValue::BS(values) => DynamoValue::Bs(values.iter().map(|b| Blob::new(b.0.clone())).collect()),
        AttributeValue::M(map) => DynamoValue::M(to_dynamo_item(map)),
        AttributeValue::L(list) => DynamoValue::L(list.iter().map(to_dynamo_value).collect()),
        AttributeValue::NULL(null) => DynamoValue::Null(*null),
        AttributeValue::BOOL(flag) => DynamoValue::Bool(*flag),
    }
}

fn to_dynamo_item(item: &Item) -> HashMap<String, DynamoValue> {
    item.iter().map(|(name, value)| (name.clone(), to_dynamo_value(value))).collect()
}

/// 表和变更日志的属性值结构相同但类型不同，用宏生成两份转换
macro_rules! from_sdk_value {
    ($fn_name:ident, $item_fn:ident, $sdk:ident) => {
        fn $fn_name(value: &$sdk) -> Result<AttributeValue> {
            Ok(match value {
                $sdk::S(s) => AttributeValue::S(s.clone()),
                $sdk::N(n) => AttributeValue::N(n.clone()),
                $sdk::B(b) => AttributeValue::B(Binary(b.as_ref().to_vec())),
                $sdk::Ss(values) => AttributeValue::SS(values.clone()),
                $sdk::Ns(values) => AttributeValue::NS(values.clone()),
                $sdk::Bs(values) => AttributeValue::BS(values.iter().map(|b| Binary(b.as_ref().to_vec())).collect()),
                $sdk::M(map) => AttributeValue::M($item_fn(map)?),
                $sdk::L(list) => AttributeValue::L(list.iter().map($fn_name).collect::<Result<_>>()?),
                $sdk::Null(null) => AttributeValue::NULL(*null),
                $sdk::Bool(flag) => AttributeValue::BOOL(*flag),
                other => return Err(BackupError::Unknown(format!("不支持的属性值类型: {:?}", other))),
            })
        }

        fn $item_fn(item: &HashMap<String, $sdk>) -> Result<Item> {
            item.iter()
                .map(|(name, value)| Ok((name.clone(), $fn_name(value)?)))
                .collect()
        }
    };
}

from_sdk_value!(from_dynamo_value, from_dynamo_item, DynamoValue);
from_sdk_value!(from_stream_value, from_stream_item, StreamValue);

fn to_write_request(op: &WriteOp) -> Result<WriteRequest> {
    let request = match op {
        WriteOp::Put(item) => WriteRequest::builder()
            .put_request(
                PutRequest::builder()
                    .set_item(Some(to_dynamo_item(item)))
                    .build()
                    .map_err(|e| BackupError::Unknown(e.to_string()))?,
            )
            .build(),
        WriteOp::Delete(keys) => WriteRequest::builder()
            .delete_request(
                DeleteRequest::builder()
                    .set_key(Some(to_dynamo_item(keys)))
                    .build()
                    .map_err(|e| BackupError::Unknown(e.to_string()))?,
            )
            .build(),
    };
    Ok(request)
}

fn from_write_request(request: &WriteRequest) -> Result<WriteOp> {
    if let Some(put) = request.put_request() {
        return Ok(WriteOp::Put(from_dynamo_item(put.item())?));
    }
    if let Some(delete) = request.delete_request() {
        return Ok(WriteOp::Delete(from_dynamo_item(delete.key())?));
    }
    Err(BackupError::Unknown("未处理的写请求既不是写入也不是删除".to_string()))
}

// ============================================================================
// S3
// ============================================================================

/// 开启版本控制的 S3 存储桶
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(sdk_config: &SdkConfig, transport: &TransportConfig, bucket: impl Into<String>) -> Self {
        // 自定义端点（本地模拟服务）通常不支持虚拟主机风格寻址
        let config = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(transport.endpoint_url.is_some())
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>, options: &PutOptions) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .server_side_encryption(ServerSideEncryption::from(options.encryption.as_str()))
            .storage_class(StorageClass::from(options.storage_class.as_str()))
            .send()
            .await
            .map_err(|e| remote_error("s3:PutObject", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| remote_error("s3:DeleteObject", e))?;
        Ok(())
    }

    async fn list_versions(&self, prefix: &str, page: Option<VersionPageToken>) -> Result<VersionPage> {
        let (key_marker, version_id_marker) = match page {
            Some(token) => (Some(token.key_marker), token.version_id_marker),
            None => (None, None),
        };

        let output = self
            .client
            .list_object_versions()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_key_marker(key_marker)
            .set_version_id_marker(version_id_marker)
            .send()
            .await
            .map_err(|e| remote_error("s3:ListObjectVersions", e))?;

        let mut records = Vec::new();
        for version in output.versions() {
            let (Some(key), Some(version_id), Some(modified)) = (version.key(), version.version_id(), version.last_modified())
            else {
                warn!("⚠️ 版本信息不完整，跳过: {:?}", version);
                continue;
            };
            records.push(VersionRecord {
                key: key.to_string(),
                version_id: version_id.to_string(),
                last_modified: to_chrono(modified),
                is_tombstone: false,
                size: version.size().map(|size| size.max(0) as u64),
            });
        }
        for marker in output.delete_markers() {
            let (Some(key), Some(version_id), Some(modified)) = (marker.key(), marker.version_id(), marker.last_modified())
            else {
                warn!("⚠️ 删除标记信息不完整，跳过: {:?}", marker);
                continue;
            };
            records.push(VersionRecord {
                key: key.to_string(),
                version_id: version_id.to_string(),
                last_modified: to_chrono(modified),
                is_tombstone: true,
                size: None,
            });
        }

        // 内容版本与删除标记分属两个数组，合并回按地址升序、同一地址内从新到旧的列表顺序；
        // 稳定排序保留各数组内部的原始先后
        records.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| b.last_modified.cmp(&a.last_modified)));

        let next = if output.is_truncated().unwrap_or(false) {
            let key_marker = output
                .next_key_marker()
                .ok_or_else(|| missing_field("s3:ListObjectVersions", "NextKeyMarker"))?;
            Some(VersionPageToken {
                key_marker: key_marker.to_string(),
                version_id_marker: output.next_version_id_marker().map(str::to_string),
            })
        } else {
            None
        };

        debug!("📄 S3 版本列表: {} 条, 截断: {}", records.len(), next.is_some());
        Ok(VersionPage { records, next })
    }

    async fn get_version(&self, key: &str, version_id: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| remote_error("s3:GetObject", e))?;

        let bytes = output.body.collect().await.map_err(|e| {
            BackupError::from(RemoteError::new("s3:GetObject", RemoteErrorKind::Transport, e.to_string()))
        })?;
        Ok(bytes.into_bytes().to_vec())
    }
}

// ============================================================================
// DynamoDB
// ============================================================================

/// DynamoDB 表
pub struct DynamoTable {
    client: aws_sdk_dynamodb::Client,
}

impl DynamoTable {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_dynamodb::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl TableApi for DynamoTable {
    async fn describe_key_schema(&self, table: &str) -> Result<Vec<String>> {
        let output = self
            .client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| remote_error("dynamodb:DescribeTable", e))?;

        let description = output
            .table()
            .ok_or_else(|| missing_field("dynamodb:DescribeTable", "Table"))?;
        Ok(description
            .key_schema()
            .iter()
            .map(|element| element.attribute_name().to_string())
            .collect())
    }

    async fn scan_page(&self, table: &str, page_size: usize, start: Option<KeyMap>) -> Result<ScanPage> {
        let output = self
            .client
            .scan()
            .table_name(table)
            .limit(i32::try_from(page_size).unwrap_or(i32::MAX))
            .set_exclusive_start_key(start.as_ref().map(to_dynamo_item))
            .send()
            .await
            .map_err(|e| remote_error("dynamodb:Scan", e))?;

        let items = output.items().iter().map(from_dynamo_item).collect::<Result<Vec<_>>>()?;
        let next_token = output.last_evaluated_key().map(from_dynamo_item).transpose()?;
        Ok(ScanPage { items, next_token })
    }

    async fn get_item(&self, table: &str, keys: &KeyMap) -> Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(to_dynamo_item(keys)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| remote_error("dynamodb:GetItem", e))?;

        output.item().map(from_dynamo_item).transpose()
    }

    async fn batch_write(&self, table: &str, ops: Vec<WriteOp>) -> Result<Vec<WriteOp>> {
        let requests = ops.iter().map(to_write_request).collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|e| remote_error("dynamodb:BatchWriteItem", e))?;

        match output.unprocessed_items().and_then(|unprocessed| unprocessed.get(table)) {
            Some(requests) => requests.iter().map(from_write_request).collect(),
            None => Ok(Vec::new()),
        }
    }
}

// ============================================================================
// DynamoDB Streams
// ============================================================================

/// 表的 DynamoDB Streams 变更日志
pub struct DynamoChangeLog {
    tables: aws_sdk_dynamodb::Client,
    streams: aws_sdk_dynamodbstreams::Client,
}

impl DynamoChangeLog {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            tables: aws_sdk_dynamodb::Client::new(sdk_config),
            streams: aws_sdk_dynamodbstreams::Client::new(sdk_config),
        }
    }

    fn to_event(record: &aws_sdk_dynamodbstreams::types::Record) -> Result<Option<ChangeEvent>> {
        let kind = match record.event_name() {
            Some(OperationType::Insert) => EventKind::Insert,
            Some(OperationType::Modify) => EventKind::Modify,
            Some(OperationType::Remove) => EventKind::Remove,
            other => {
                warn!("⚠️ 未知的变更类型，跳过: {:?}", other);
                return Ok(None);
            }
        };
        let Some(data) = record.dynamodb() else {
            warn!("⚠️ 变更记录缺少数据，跳过: {:?}", record.event_id());
            return Ok(None);
        };
        let Some(keys) = data.keys() else {
            warn!("⚠️ 变更记录缺少主键，跳过: {:?}", record.event_id());
            return Ok(None);
        };

        let new_image = match kind {
            EventKind::Remove => None,
            _ => data.new_image().map(from_stream_item).transpose()?,
        };

        Ok(Some(ChangeEvent {
            keys: from_stream_item(keys)?,
            kind,
            new_image,
            source_partition: String::new(),
        }))
    }
}

#[async_trait]
impl ChangeLogApi for DynamoChangeLog {
    async fn describe_source(&self, table: &str) -> Result<SourceDescription> {
        let output = self
            .tables
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| remote_error("dynamodb:DescribeTable", e))?;

        let stream_ref = output
            .table()
            .and_then(|description| description.latest_stream_arn())
            .ok_or_else(|| {
                RemoteError::permanent("dynamodb:DescribeTable", format!("表 {} 未开启变更流", table))
            })?
            .to_string();

        let mut partitions = Vec::new();
        let mut start_shard: Option<String> = None;
        loop {
            let output = self
                .streams
                .describe_stream()
                .stream_arn(&stream_ref)
                .set_exclusive_start_shard_id(start_shard.take())
                .send()
                .await
                .map_err(|e| remote_error("streams:DescribeStream", e))?;

            let description = output
                .stream_description()
                .ok_or_else(|| missing_field("streams:DescribeStream", "StreamDescription"))?;
            partitions.extend(
                description
                    .shards()
                    .iter()
                    .filter_map(|shard| shard.shard_id().map(str::to_string)),
            );

            match description.last_evaluated_shard_id() {
                Some(last) => start_shard = Some(last.to_string()),
                None => break,
            }
        }

        Ok(SourceDescription { stream_ref, partitions })
    }

    async fn get_partition_cursor(&self, stream_ref: &str, partition_id: &str, position: CursorPosition) -> Result<String> {
        let iterator_type = match position {
            CursorPosition::TrimHorizon => ShardIteratorType::TrimHorizon,
            CursorPosition::Latest => ShardIteratorType::Latest,
        };

        let output = self
            .streams
            .get_shard_iterator()
            .stream_arn(stream_ref)
            .shard_id(partition_id)
            .shard_iterator_type(iterator_type)
            .send()
            .await
            .map_err(|e| remote_error("streams:GetShardIterator", e))?;

        output
            .shard_iterator()
            .map(str::to_string)
            .ok_or_else(|| missing_field("streams:GetShardIterator", "ShardIterator"))
    }

    async fn poll(&self, cursor: &str) -> Result<PollResult> {
        let output = self
            .streams
            .get_records()
            .shard_iterator(cursor)
            .send()
            .await
            .map_err(|e| remote_error("streams:GetRecords", e))?;

        let mut events = Vec::with_capacity(output.records().len());
        for record in output.records() {
            if let Some(event) = Self::to_event(record)? {
                events.push(event);
            }
        }

        Ok(PollResult {
            events,
            next_cursor: output.next_shard_iterator().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_attribute_values_convert_both_ways() {
        let mut nested = BTreeMap::new();
        nested.insert("flag".to_string(), AttributeValue::BOOL(true));
        nested.insert("raw".to_string(), AttributeValue::B(Binary(vec![0, 255])));

        let mut item = Item::new();
        item.insert("id".to_string(), AttributeValue::S("a".to_string()));
        item.insert("tags".to_string(), AttributeValue::SS(vec!["x".to_string()]));
        item.insert("nested".to_string(), AttributeValue::M(nested));
        item.insert(
            "list".to_string(),
            AttributeValue::L(vec![AttributeValue::N("1".to_string()), AttributeValue::NULL(true)]),
        );

        let converted = from_dynamo_item(&to_dynamo_item(&item)).unwrap();
        assert_eq!(converted, item);
    }

    #[test]
    fn test_write_requests_round_trip_for_unprocessed_items() {
        let mut keys = KeyMap::new();
        keys.insert("id".to_string(), AttributeValue::N("7".to_string()));

        let request = to_write_request(&WriteOp::Delete(keys.clone())).unwrap();
        assert_eq!(from_write_request(&request).unwrap(), WriteOp::Delete(keys));
    }
}
