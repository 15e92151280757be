use std::path::PathBuf;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::CargoEnv;

/// 全局日志初始化
///
/// 开发和测试环境输出到标准输出，生产环境按天滚动写入日志目录。
/// 返回的 guard 必须在进程结束前一直持有，否则缓冲中的日志会丢失。
pub struct Logger;

impl Logger {
    pub fn new(cargo_env: CargoEnv, default_filter: &str) -> WorkerGuard {
        Self::new_with_log_dir(cargo_env, default_filter, None)
    }

    pub fn new_with_log_dir(cargo_env: CargoEnv, default_filter: &str, log_dir: Option<PathBuf>) -> WorkerGuard {
        let (writer, guard) = match cargo_env {
            CargoEnv::Development | CargoEnv::Test => tracing_appender::non_blocking(std::io::stdout()),
            CargoEnv::Production => Self::rolling_writer(log_dir),
        };

        // env var: `RUST_LOG`
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false),
            )
            .init();

        guard
    }

    fn rolling_writer(log_dir: Option<PathBuf>) -> (NonBlocking, WorkerGuard) {
        let mut directory = Self::get_log_directory(log_dir);

        if let Err(e) = std::fs::create_dir_all(&directory) {
            eprintln!("⚠️ 无法创建日志目录 {:?}: {}，回退到 ./logs", directory, e);
            directory = PathBuf::from("logs");
            std::fs::create_dir_all(&directory).ok();
        }

        println!("✅ 日志将输出到目录: {:?}", directory);
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&directory, "log"))
    }

    fn get_log_directory(log_dir: Option<PathBuf>) -> PathBuf {
        if let Some(dir) = log_dir {
            return dir;
        }

        if let Ok(log_dir_env) = std::env::var("LOG_DIR") {
            return PathBuf::from(log_dir_env);
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                return exe_dir.join("logs");
            }
        }

        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("logs")
    }
}
