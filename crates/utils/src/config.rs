use std::{fmt, path::Path, str::FromStr};

/// 运行环境，决定加载哪个环境文件以及日志输出位置
#[derive(Clone, Debug, Copy, PartialEq, Eq, Default)]
pub enum CargoEnv {
    #[default]
    Development,
    Production,
    Test,
}

impl CargoEnv {
    /// 从 `CARGO_ENV` 读取运行环境，未设置或无法识别时为开发环境
    pub fn from_env() -> Self {
        std::env::var("CARGO_ENV")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or_default()
    }

    /// 对应的环境文件名
    pub fn env_file(&self) -> &'static str {
        match self {
            CargoEnv::Development => ".env.development",
            CargoEnv::Production => ".env.production",
            CargoEnv::Test => ".env.test",
        }
    }
}

impl FromStr for CargoEnv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(CargoEnv::Development),
            "production" | "prod" => Ok(CargoEnv::Production),
            "test" => Ok(CargoEnv::Test),
            other => Err(format!("未知的 CARGO_ENV: {}", other)),
        }
    }
}

impl fmt::Display for CargoEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CargoEnv::Development => "development",
            CargoEnv::Production => "production",
            CargoEnv::Test => "test",
        };
        f.write_str(name)
    }
}

/// 环境配置加载器
pub struct EnvLoader;

impl EnvLoader {
    /// 根据 CARGO_ENV 加载对应的环境配置文件
    ///
    /// 找不到 `.env.{CARGO_ENV}` 时回退到 `.env`；两者都不存在时只使用进程环境变量。
    /// 返回实际加载的文件名。已存在的环境变量不会被覆盖。
    pub fn load_env_file() -> Result<Option<&'static str>, dotenvy::Error> {
        let cargo_env = CargoEnv::from_env();
        Self::load_for(cargo_env)
    }

    pub fn load_for(cargo_env: CargoEnv) -> Result<Option<&'static str>, dotenvy::Error> {
        let env_file = cargo_env.env_file();

        if Path::new(env_file).exists() {
            dotenvy::from_filename(env_file)?;
            println!("✅ 已加载环境配置文件: {} (CARGO_ENV={})", env_file, cargo_env);
            return Ok(Some(env_file));
        }

        eprintln!("⚠️  配置文件 {} 不存在，尝试加载默认的 .env 文件", env_file);
        if Path::new(".env").exists() {
            dotenvy::from_filename(".env")?;
            println!("✅ 已加载默认配置文件: .env");
            return Ok(Some(".env"));
        }

        eprintln!("⚠️  未找到任何配置文件，只使用进程环境变量");
        Ok(None)
    }
}
