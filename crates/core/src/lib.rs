pub mod config;
pub mod errors;
pub mod logging;
pub mod traits;

pub use config::*;
pub use errors::*;
pub use logging::{init_logging, init_logging_from_config};
pub use traits::*;
