use crate::{
    error::{BackupError, Result},
    persistence::object_store::{Encryption, PutOptions},
    recovery::retry_manager::RetryPolicy,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr, time::Duration};
use tracing::info;

/// 对象存储（备份目标）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// 存储桶名称
    pub bucket: String,
    /// 逻辑前缀，所有历史对象都位于 `{prefix}/` 之下
    pub prefix: String,
    /// 存储桶所在区域
    pub region: String,
    /// 服务端加密方式
    pub encryption: Encryption,
    /// 存储类型
    pub storage_class: String,
}

/// 表配置（捕获源或恢复目标）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// 表名
    pub table: String,
    /// 表所在区域
    pub region: String,
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大重试次数（不含首次调用）
    pub max_retries: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
}

/// 客户端传输配置
///
/// 进程内创建一次，之后只读，显式传入每个客户端的构造函数。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    /// 自定义服务端点（例如本地模拟服务）
    pub endpoint_url: Option<String>,
    /// 建立连接超时（毫秒）
    pub connect_timeout_ms: Option<u64>,
    /// 单次操作超时（毫秒）
    pub operation_timeout_ms: Option<u64>,
}

/// 变更捕获配置（增量与全量共用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub source: TableConfig,
    pub sink: SinkConfig,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
    /// 全表扫描每页条数
    pub scan_page_size: usize,
    /// 分片连续空轮询预算
    pub empty_poll_budget: u32,
}

/// 时间点恢复配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    pub sink: SinkConfig,
    pub target: TableConfig,
    /// 恢复到的时间点，为空表示最新状态
    pub restore_time: Option<DateTime<Utc>>,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
    /// 每批写入条数
    pub batch_size: usize,
    /// 并发读取/写入数
    pub concurrency: usize,
}

/// 表批量写入单次请求的条数上限
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// 收集环境变量解析过程中的全部错误
#[derive(Default)]
struct EnvReader {
    errors: Vec<String>,
}

impl EnvReader {
    fn required(&mut self, name: &str) -> String {
        match std::env::var(name) {
            Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => {
                self.errors.push(format!("缺少必填配置: {}", name));
                String::new()
            }
        }
    }

    fn optional(&mut self, name: &str) -> Option<String> {
        std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&mut self, name: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(name) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                self.errors.push(format!("{} 格式错误 ({}): {}", name, raw, e));
                default
            }),
            None => default,
        }
    }

    fn parsed_opt<T>(&mut self, name: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.optional(name)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                self.errors.push(format!("{} 格式错误 ({}): {}", name, raw, e));
                None
            }
        }
    }
}

impl SinkConfig {
    fn read(env: &mut EnvReader) -> Self {
        let encryption = env.parsed("S3_ENCRYPTION", Encryption::Aes256);
        Self {
            bucket: env.required("S3_BUCKET"),
            prefix: env.required("S3_PREFIX"),
            region: env.required("S3_REGION"),
            encryption,
            storage_class: env
                .optional("S3_STORAGE_CLASS")
                .unwrap_or_else(|| "STANDARD_IA".to_string()),
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.bucket.is_empty() {
            errors.push("S3Bucket 不能为空".to_string());
        } else if !is_valid_bucket_name(&self.bucket) {
            errors.push(format!("无效的 S3Bucket 名称: {}", self.bucket));
        }
        if self.prefix.trim_matches('/').is_empty() {
            errors.push("S3Prefix 不能为空".to_string());
        }
        if self.region.is_empty() {
            errors.push("S3Region 不能为空".to_string());
        } else if !is_valid_region(&self.region) {
            errors.push(format!("无效的 S3Region: {}", self.region));
        }
        if self.storage_class.is_empty() {
            errors.push("存储类型不能为空".to_string());
        }
    }

    /// 写入对象时使用的参数
    pub fn put_options(&self) -> PutOptions {
        PutOptions {
            encryption: self.encryption,
            storage_class: self.storage_class.clone(),
        }
    }
}

impl TableConfig {
    fn read(env: &mut EnvReader) -> Self {
        Self {
            table: env.required("DB_TABLE"),
            region: env.required("DB_REGION"),
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.table.is_empty() {
            errors.push("DbTable 不能为空".to_string());
        } else if !is_valid_table_name(&self.table) {
            errors.push(format!("无效的 DbTable 名称: {}", self.table));
        }
        if self.region.is_empty() {
            errors.push("DbRegion 不能为空".to_string());
        } else if !is_valid_region(&self.region) {
            errors.push(format!("无效的 DbRegion: {}", self.region));
        }
    }
}

impl RetryConfig {
    fn read(env: &mut EnvReader) -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env.parsed("BACKUP_MAX_RETRIES", defaults.max_retries),
            initial_delay_ms: env.parsed("BACKUP_RETRY_INITIAL_MS", defaults.initial_delay_ms),
            max_delay_ms: env.parsed("BACKUP_RETRY_MAX_MS", defaults.max_delay_ms),
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.initial_delay_ms > self.max_delay_ms {
            errors.push(format!(
                "重试初始延迟({}ms)不能大于最大延迟({}ms)",
                self.initial_delay_ms, self.max_delay_ms
            ));
        }
    }

    /// 转换为重试策略（使用默认的可重试判定）
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
        }
    }
}

impl TransportConfig {
    fn read(env: &mut EnvReader) -> Self {
        Self {
            endpoint_url: env.optional("AWS_ENDPOINT_URL"),
            connect_timeout_ms: env.parsed_opt("AWS_CONNECT_TIMEOUT_MS"),
            operation_timeout_ms: env.parsed_opt("AWS_OPERATION_TIMEOUT_MS"),
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

impl CaptureConfig {
    /// 从环境变量加载捕获配置
    ///
    /// 所有格式错误和校验错误一次性汇总返回。
    pub fn from_env() -> Result<Self> {
        info!("🔧 从环境变量加载变更捕获配置...");

        let mut env = EnvReader::default();
        let config = Self {
            source: TableConfig::read(&mut env),
            sink: SinkConfig::read(&mut env),
            retry: RetryConfig::read(&mut env),
            transport: TransportConfig::read(&mut env),
            scan_page_size: env.parsed("BACKUP_SCAN_PAGE_SIZE", 25),
            empty_poll_budget: env.parsed("BACKUP_EMPTY_POLL_BUDGET", 10),
        };

        let mut errors = env.errors;
        config.collect_errors(&mut errors);
        if !errors.is_empty() {
            return Err(BackupError::Configuration(errors));
        }

        info!("✅ 变更捕获配置加载完成");
        info!("📊 源表: {} ({})", config.source.table, config.source.region);
        info!("🪣 备份位置: s3://{}/{}", config.sink.bucket, config.sink.prefix);

        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BackupError::Configuration(errors))
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        self.source.collect_errors(errors);
        self.sink.collect_errors(errors);
        self.retry.collect_errors(errors);
        if self.scan_page_size == 0 {
            errors.push("扫描页大小必须大于0".to_string());
        }
        if self.empty_poll_budget == 0 {
            errors.push("空轮询预算必须大于0".to_string());
        }
    }
}

impl RestoreConfig {
    /// 从环境变量加载恢复配置
    pub fn from_env() -> Result<Self> {
        info!("🔧 从环境变量加载时间点恢复配置...");

        let mut env = EnvReader::default();
        let restore_time = match env.optional("RESTORE_TIME") {
            Some(raw) => match parse_restore_time(&raw) {
                Some(time) => Some(time),
                None => {
                    env.errors.push(format!("RESTORE_TIME 格式错误: {}", raw));
                    None
                }
            },
            None => None,
        };

        let config = Self {
            sink: SinkConfig::read(&mut env),
            target: TableConfig::read(&mut env),
            restore_time,
            retry: RetryConfig::read(&mut env),
            transport: TransportConfig::read(&mut env),
            batch_size: env.parsed("RESTORE_BATCH_SIZE", MAX_BATCH_WRITE_ITEMS),
            concurrency: env.parsed("RESTORE_CONCURRENCY", 4),
        };

        let mut errors = env.errors;
        config.collect_errors(&mut errors);
        if !errors.is_empty() {
            return Err(BackupError::Configuration(errors));
        }

        info!("✅ 时间点恢复配置加载完成");
        match config.restore_time {
            Some(time) => info!("⏱️ 恢复时间点: {}", time.to_rfc3339()),
            None => info!("⏱️ 恢复时间点: 最新"),
        }

        Ok(config)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BackupError::Configuration(errors))
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        self.sink.collect_errors(errors);
        self.target.collect_errors(errors);
        self.retry.collect_errors(errors);
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_WRITE_ITEMS {
            errors.push(format!("批量写入大小必须在1到{}之间", MAX_BATCH_WRITE_ITEMS));
        }
        if self.concurrency == 0 {
            errors.push("并发数必须大于0".to_string());
        }
    }
}

/// 解析恢复时间点：RFC 3339 或 Unix 毫秒时间戳
pub fn parse_restore_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

/// 区域格式：us-east-1、eu-west-1 ...
pub fn is_valid_region(region: &str) -> bool {
    let parts: Vec<&str> = region.split('-').collect();
    match parts.as_slice() {
        [area, name, number] => {
            area.len() == 2
                && area.chars().all(|c| c.is_ascii_lowercase())
                && !name.is_empty()
                && name.chars().all(|c| c.is_ascii_lowercase())
                && !number.is_empty()
                && number.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// 存储桶命名规则：3-63个字符，小写字母、数字、点和连字符，首尾为字母或数字
pub fn is_valid_bucket_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if !(3..=63).contains(&bytes.len()) {
        return false;
    }
    let edge_ok = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    edge_ok(bytes[0])
        && edge_ok(bytes[bytes.len() - 1])
        && bytes
            .iter()
            .all(|&c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'.' || c == b'-')
}

/// 表名规则：1-255个字符，字母、数字、下划线、点和连字符
pub fn is_valid_table_name(name: &str) -> bool {
    (1..=255).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}
