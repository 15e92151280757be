//! 跨模块的流水线测试
//!
//! 全部基于 `backends::memory`，不依赖任何外部服务。

pub mod restore_pipeline_test;

use crate::{
    config::{CaptureConfig, RestoreConfig, RetryConfig, SinkConfig, TableConfig, TransportConfig},
    model::{AttributeValue, ChangeEvent, EventKind, Item, KeyMap},
    persistence::Encryption,
};
use chrono::{DateTime, Utc};

pub const PREFIX: &str = "backups/users";

pub fn init_logging() {
    tracing_subscriber::fmt().with_env_filter("debug").with_test_writer().try_init().ok();
}

fn sink_config() -> SinkConfig {
    SinkConfig {
        bucket: "backup-bucket".to_string(),
        prefix: PREFIX.to_string(),
        region: "us-east-1".to_string(),
        encryption: Encryption::Aes256,
        storage_class: "STANDARD_IA".to_string(),
    }
}

fn table_config() -> TableConfig {
    TableConfig {
        table: "users".to_string(),
        region: "us-east-1".to_string(),
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        initial_delay_ms: 1,
        max_delay_ms: 2,
    }
}

/// 创建测试用捕获配置
pub fn capture_config() -> CaptureConfig {
    CaptureConfig {
        source: table_config(),
        sink: sink_config(),
        retry: fast_retry(),
        transport: TransportConfig::default(),
        scan_page_size: 2,
        empty_poll_budget: 3,
    }
}

/// 创建测试用恢复配置
pub fn restore_config(restore_time: Option<DateTime<Utc>>) -> RestoreConfig {
    RestoreConfig {
        sink: sink_config(),
        target: table_config(),
        restore_time,
        retry: fast_retry(),
        transport: TransportConfig::default(),
        batch_size: 25,
        concurrency: 4,
    }
}

pub fn keys(id: u32) -> KeyMap {
    let mut keys = KeyMap::new();
    keys.insert("id".to_string(), AttributeValue::N(id.to_string()));
    keys
}

pub fn user(id: u32, name: &str) -> Item {
    let mut item = keys(id);
    item.insert("name".to_string(), AttributeValue::S(name.to_string()));
    item
}

pub fn change(id: u32, kind: EventKind, name: &str) -> ChangeEvent {
    ChangeEvent {
        keys: keys(id),
        kind,
        new_image: (kind != EventKind::Remove).then(|| user(id, name)),
        source_partition: String::new(),
    }
}

pub fn address(id: u32) -> String {
    crate::model::content_address(PREFIX, &crate::model::serialize_keys(&keys(id)).unwrap_or_default())
}
