use std::sync::Arc;
use stream_backup::{
    backends::aws::{load_sdk_config, DynamoChangeLog, DynamoTable, S3ObjectStore},
    config::{CaptureConfig, RestoreConfig},
    PointInTimeRestore, StreamBackupService,
};
use tracing::{error, info};
use utils::{CargoEnv, EnvLoader, Logger};

/// 运行模式（`BACKUP_MODE`）
#[derive(Debug, Clone, Copy)]
enum Mode {
    Incremental,
    Full,
    Restore,
}

impl Mode {
    fn from_env() -> anyhow::Result<Self> {
        match std::env::var("BACKUP_MODE").unwrap_or_else(|_| "incremental".to_string()).as_str() {
            "incremental" => Ok(Mode::Incremental),
            "full" => Ok(Mode::Full),
            "restore" => Ok(Mode::Restore),
            other => anyhow::bail!("未知的 BACKUP_MODE: {} (可选 incremental | full | restore)", other),
        }
    }
}

async fn capture(mode: Mode) -> anyhow::Result<()> {
    let config = CaptureConfig::from_env()?;

    let source_config = load_sdk_config(&config.source.region, &config.transport).await;
    let sink_config = load_sdk_config(&config.sink.region, &config.transport).await;

    let store = Arc::new(S3ObjectStore::new(&sink_config, &config.transport, config.sink.bucket.clone()));
    let service = StreamBackupService::new(
        config,
        Arc::new(DynamoChangeLog::new(&source_config)),
        Arc::new(DynamoTable::new(&source_config)),
        store,
    );

    let stats = match mode {
        Mode::Full => service.capture_full().await?,
        _ => service.capture_incremental().await?,
    };
    info!("📊 捕获统计: {:?}", stats);
    Ok(())
}

async fn restore() -> anyhow::Result<()> {
    let config = RestoreConfig::from_env()?;

    let target_config = load_sdk_config(&config.target.region, &config.transport).await;
    let sink_config = load_sdk_config(&config.sink.region, &config.transport).await;

    let store = Arc::new(S3ObjectStore::new(&sink_config, &config.transport, config.sink.bucket.clone()));
    let table = Arc::new(DynamoTable::new(&target_config));

    let stats = PointInTimeRestore::new(config, store, table).restore().await?;
    info!(
        "📊 恢复统计: {} 次写入, {} 次删除, {} 个地址跳过",
        stats.puts, stats.deletes, stats.gaps_skipped
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境配置文件
    if let Err(e) = EnvLoader::load_env_file() {
        eprintln!("⚠️ 加载环境配置文件失败: {}", e);
    }

    let guard = Logger::new(CargoEnv::from_env(), "stream_backup=info");

    let mode = Mode::from_env()?;
    info!("🎯 启动 Stream-Backup ({:?})", mode);

    let outcome = match mode {
        Mode::Incremental | Mode::Full => capture(mode).await,
        Mode::Restore => restore().await,
    };

    if let Err(e) = outcome {
        error!("❌ 运行失败: {:#}", e);
        drop(guard);
        std::process::exit(1);
    }

    info!("✅ 运行完成");
    Ok(())
}
