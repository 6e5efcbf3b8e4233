//! 基础设施实现
//!
//! - **in_memory_store**: 带TTL和订阅的内存键值存储
//! - **encryption**: 写入存储前的值加密

pub mod encryption;
pub mod in_memory_store;

pub use encryption::{Encryptor, ValueCipher};
pub use in_memory_store::InMemoryKvStore;
