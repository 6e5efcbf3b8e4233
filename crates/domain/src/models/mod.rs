pub mod stats;
pub mod task;
pub mod topology;

pub use stats::*;
pub use task::*;
pub use topology::*;
