//! 表数据、变更事件与对象版本的数据模型
//!
//! 属性值采用 DynamoDB JSON 的外部标签形式（`{"S": "..."}`），
//! 这样备份内容与表API的线上格式一致，可以原样写回。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{BackupError, Result};

/// 二进制属性值
///
/// 序列化为 base64 字符串。反序列化兼容三种形式：
/// base64 字符串、字节数组，以及经由 JSON 传输后丢失类型的
/// `{"type": "Buffer", "data": [..]}` 形式。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binary(pub Vec<u8>);

impl Serialize for Binary {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BinaryRepr {
    Base64(String),
    Bytes(Vec<u8>),
    Buffer {
        #[serde(rename = "type")]
        kind: String,
        data: Vec<u8>,
    },
}

impl<'de> Deserialize<'de> for Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match BinaryRepr::deserialize(deserializer)? {
            BinaryRepr::Base64(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Binary)
                .map_err(serde::de::Error::custom),
            BinaryRepr::Bytes(bytes) => Ok(Binary(bytes)),
            BinaryRepr::Buffer { kind, data } if kind == "Buffer" => Ok(Binary(data)),
            BinaryRepr::Buffer { kind, .. } => Err(serde::de::Error::custom(format!("未知的二进制编码类型: {}", kind))),
        }
    }
}

/// DynamoDB 属性值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    N(String),
    B(Binary),
    SS(Vec<String>),
    NS(Vec<String>),
    BS(Vec<Binary>),
    M(BTreeMap<String, AttributeValue>),
    L(Vec<AttributeValue>),
    NULL(bool),
    BOOL(bool),
}

/// 一条完整的表记录
pub type Item = BTreeMap<String, AttributeValue>;

/// 只包含主键属性的记录
///
/// 使用有序映射，保证同一主键无论属性出现顺序如何都序列化为同一字符串。
pub type KeyMap = BTreeMap<String, AttributeValue>;

/// 将主键序列化为分组与寻址使用的规范字符串
pub fn serialize_keys(keys: &KeyMap) -> Result<String> {
    Ok(serde_json::to_string(keys)?)
}

/// 从完整记录中按主键结构投影出主键
pub fn project_keys(item: &Item, key_schema: &[String]) -> Option<KeyMap> {
    key_schema
        .iter()
        .map(|name| item.get(name).map(|value| (name.clone(), value.clone())))
        .collect()
}

/// 计算主键对应的内容地址：`{prefix}/{sha256(serialize(keys))}`
pub fn content_address(prefix: &str, serialized_keys: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(serialized_keys.as_bytes()));
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        digest
    } else {
        format!("{}/{}", prefix, digest)
    }
}

/// 变更事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Insert,
    Modify,
    Remove,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "INSERT",
            EventKind::Modify => "MODIFY",
            EventKind::Remove => "REMOVE",
        }
    }
}

/// 一条行级变更事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// 主键
    pub keys: KeyMap,
    /// 事件类型
    pub kind: EventKind,
    /// 变更后的完整记录（REMOVE 时为空）
    pub new_image: Option<Item>,
    /// 来源分片（全表扫描合成的事件为 `scan`）
    pub source_partition: String,
}

impl ChangeEvent {
    /// 由全表扫描合成的 INSERT 事件
    pub fn snapshot(keys: KeyMap, item: Item) -> Self {
        Self {
            keys,
            kind: EventKind::Insert,
            new_image: Some(item),
            source_partition: SNAPSHOT_PARTITION.to_string(),
        }
    }

    pub fn serialized_keys(&self) -> Result<String> {
        serialize_keys(&self.keys)
    }
}

/// 全表扫描事件使用的伪分片名
pub const SNAPSHOT_PARTITION: &str = "scan";

/// 对象存储中某个地址的一次写入或删除标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// 内容地址
    pub key: String,
    pub version_id: String,
    pub last_modified: DateTime<Utc>,
    /// 是否为删除标记
    pub is_tombstone: bool,
    /// 内容大小（删除标记为空）
    pub size: Option<u64>,
}

impl VersionRecord {
    /// 是否携带可读取的内容
    pub fn has_content(&self) -> bool {
        !self.is_tombstone && self.size.unwrap_or(0) > 0
    }
}

/// 版本对账结果中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledEntry {
    pub key: String,
    /// 需要读取的版本
    pub version_id: String,
    /// 目标时间点该地址是否已被删除（或尚未存在）
    pub deleted_at_target: bool,
}

/// 写回表的操作
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(Item),
    Delete(KeyMap),
}

/// 解析备份对象的内容
pub fn parse_item(body: &[u8]) -> Result<Item> {
    Ok(serde_json::from_slice(body)?)
}

/// 序列化记录作为备份内容
pub fn encode_item(item: &Item) -> Result<Vec<u8>> {
    serde_json::to_vec(item).map_err(BackupError::from)
}
