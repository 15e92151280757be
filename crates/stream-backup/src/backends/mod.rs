//! 外部服务的具体实现

pub mod memory;

#[cfg(feature = "aws")]
pub mod aws;

pub use memory::{MemoryChangeLog, MemoryObjectStore, MemoryTable};
