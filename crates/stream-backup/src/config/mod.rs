pub mod settings;

pub use settings::{
    CaptureConfig, RestoreConfig, RetryConfig, SinkConfig, TableConfig, TransportConfig, MAX_BATCH_WRITE_ITEMS,
};
