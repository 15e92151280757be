//! 对象版本列表与时间点对账
//!
//! 对账把某个前缀下全部版本归约为每个地址的一条 [`ReconciledEntry`]:
//!
//! 1. 基线: 每个地址取 `last_modified <= T` 中最新的版本
//! 2. 只存在于 `T` 之后的地址: 取最早的版本，标记为已删除（`T` 时尚不存在）
//!
//! 时间相同的版本按列表位置区分：对象存储在同一地址内按从新到旧列出版本，
//! 位置靠前的视为较新。版本ID是不透明的，不参与排序。
//! 3. 删除标记: 已删除且没有内容的条目改为指向该地址最新的有内容版本，
//!    只用于提取主键；找不到内容版本的地址记为缺口，不参与写回
//! 4. 去掉前缀自身的占位对象
//!
//! 对账是纯函数，输出按地址排序。

use crate::{
    error::Result,
    model::{ReconciledEntry, VersionRecord},
    persistence::object_store::ObjectStore,
    recovery::retry_manager::{with_retry, RetryPolicy},
};
use chrono::{DateTime, Utc};
use std::{cmp::Reverse, collections::BTreeMap};
use tracing::{debug, info, warn};

/// 对账结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// 可以写回的条目（按地址排序）
    pub entries: Vec<ReconciledEntry>,
    /// 只有删除标记、无法提取主键的地址
    pub gaps: Vec<String>,
}

/// 前缀对应的目录，例如 `backups/users` -> `backups/users/`
pub fn prefix_directory(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

/// 分页列出前缀目录下的全部版本（内容版本与删除标记合并），保持列表顺序
///
/// 只列出 `{prefix}/` 之下的对象，`{prefix}-archive/...` 这类同名前缀不包含在内。
pub async fn list_all_versions(store: &dyn ObjectStore, prefix: &str, retry: &RetryPolicy) -> Result<Vec<VersionRecord>> {
    let directory = prefix_directory(prefix);
    let mut records = Vec::new();
    let mut token = None;
    let mut pages = 0usize;

    loop {
        let page = with_retry(retry, "s3:ListObjectVersions", || store.list_versions(&directory, token.clone())).await?;
        pages += 1;
        debug!("📄 第{}页版本列表: {} 条", pages, page.records.len());
        records.extend(page.records);

        match page.next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    info!("📚 前缀 {} 下共 {} 个版本 ({} 页)", directory, records.len(), pages);
    Ok(records)
}

/// 列表中第 `position` 条版本的新旧顺序，越大越新
fn order(position: usize, record: &VersionRecord) -> (DateTime<Utc>, Reverse<usize>) {
    (record.last_modified, Reverse(position))
}

/// 是否为前缀目录下的历史对象（不含占位对象本身）
fn is_history_object(key: &str, prefix: &str) -> bool {
    key.strip_prefix(&prefix_directory(prefix))
        .is_some_and(|name| !name.is_empty())
}

/// 将版本列表归约到目标时间点 `target`（为空表示最新）
///
/// `records` 须保持对象存储返回的列表顺序。
pub fn reconcile(records: &[VersionRecord], target: Option<DateTime<Utc>>, prefix: &str) -> Reconciliation {
    let at_or_before = |record: &VersionRecord| target.map_or(true, |t| record.last_modified <= t);
    let listed = || {
        records
            .iter()
            .enumerate()
            .filter(|(_, record)| is_history_object(&record.key, prefix))
    };

    // (列表位置, 选中的版本, 目标时间点是否已删除)
    let mut baseline: BTreeMap<&str, (usize, &VersionRecord, bool)> = BTreeMap::new();

    for (position, record) in listed().filter(|(_, r)| at_or_before(r)) {
        match baseline.get(record.key.as_str()) {
            Some((at, current, _)) if order(*at, current) >= order(position, record) => {}
            _ => {
                baseline.insert(record.key.as_str(), (position, record, record.is_tombstone));
            }
        }
    }

    let mut future_only: BTreeMap<&str, (usize, &VersionRecord)> = BTreeMap::new();
    for (position, record) in listed().filter(|(_, r)| !at_or_before(r)) {
        if baseline.contains_key(record.key.as_str()) {
            continue;
        }
        match future_only.get(record.key.as_str()) {
            Some((at, current)) if order(*at, current) <= order(position, record) => {}
            _ => {
                future_only.insert(record.key.as_str(), (position, record));
            }
        }
    }
    for (key, (position, record)) in future_only {
        baseline.insert(key, (position, record, true));
    }

    let mut latest_content: BTreeMap<&str, (usize, &VersionRecord)> = BTreeMap::new();
    for (position, record) in listed().filter(|(_, r)| r.has_content()) {
        match latest_content.get(record.key.as_str()) {
            Some((at, current)) if order(*at, current) >= order(position, record) => {}
            _ => {
                latest_content.insert(record.key.as_str(), (position, record));
            }
        }
    }

    let mut reconciliation = Reconciliation::default();
    for (key, (_, record, deleted)) in baseline {
        let version_id = if deleted && !record.has_content() {
            match latest_content.get(key) {
                Some((_, content)) => content.version_id.clone(),
                None => {
                    warn!("⚠️ 地址 {} 只有删除标记，无法提取主键，跳过", key);
                    reconciliation.gaps.push(key.to_string());
                    continue;
                }
            }
        } else {
            record.version_id.clone()
        };

        reconciliation.entries.push(ReconciledEntry {
            key: key.to_string(),
            version_id,
            deleted_at_target: deleted,
        });
    }

    reconciliation
}
