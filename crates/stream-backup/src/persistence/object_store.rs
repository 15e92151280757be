use crate::{error::Result, model::VersionRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// 服务端加密方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encryption {
    #[serde(rename = "AES256")]
    Aes256,
    #[serde(rename = "aws:kms")]
    AwsKms,
}

impl Encryption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encryption::Aes256 => "AES256",
            Encryption::AwsKms => "aws:kms",
        }
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encryption {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "AES256" => Ok(Encryption::Aes256),
            "aws:kms" => Ok(Encryption::AwsKms),
            other => Err(format!("必须是 'AES256' 或 'aws:kms'，实际为 '{}'", other)),
        }
    }
}

/// 写入对象时附带的参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    pub encryption: Encryption,
    pub storage_class: String,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            encryption: Encryption::Aes256,
            storage_class: "STANDARD_IA".to_string(),
        }
    }
}

/// 版本列表分页游标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPageToken {
    pub key_marker: String,
    pub version_id_marker: Option<String>,
}

/// 一页版本列表（内容版本与删除标记合并）
#[derive(Debug, Clone, Default)]
pub struct VersionPage {
    pub records: Vec<VersionRecord>,
    pub next: Option<VersionPageToken>,
}

/// 带版本控制的对象存储
///
/// 每次写入或删除都会在对应地址上产生一个新版本，
/// 由存储分配单调的版本ID和最后修改时间。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 在地址上写入新版本
    async fn put(&self, key: &str, body: Vec<u8>, options: &PutOptions) -> Result<()>;

    /// 在地址上写入删除标记
    async fn delete(&self, key: &str) -> Result<()>;

    /// 列出前缀下的所有版本（分页）
    async fn list_versions(&self, prefix: &str, page: Option<VersionPageToken>) -> Result<VersionPage>;

    /// 读取指定版本的内容
    async fn get_version(&self, key: &str, version_id: &str) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_round_trips_through_text() {
        assert_eq!("AES256".parse::<Encryption>().unwrap(), Encryption::Aes256);
        assert_eq!("aws:kms".parse::<Encryption>().unwrap(), Encryption::AwsKms);
        assert!("aes256".parse::<Encryption>().is_err());
        assert_eq!(Encryption::AwsKms.to_string(), "aws:kms");
    }
}
