pub mod job;
pub mod kv_store;

pub use job::*;
pub use kv_store::*;
