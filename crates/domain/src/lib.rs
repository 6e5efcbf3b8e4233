pub mod models;

pub use models::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
