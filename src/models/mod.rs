pub mod block_mapping;
pub mod endpoint;
pub mod task;
pub mod unit;

pub use block_mapping::*;
pub use endpoint::*;
pub use task::*;
pub use unit::*;
