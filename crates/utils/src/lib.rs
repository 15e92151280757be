pub mod config;
pub mod logger;

pub use config::{CargoEnv, EnvLoader};
pub use logger::Logger;
