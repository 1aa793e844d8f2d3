pub mod blocks;
pub mod fs;
pub mod logging;
pub mod time;

pub use blocks::*;
pub use time::*;
