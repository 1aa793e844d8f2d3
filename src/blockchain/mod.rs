pub mod chain_client;
#[cfg(any(test, feature = "testing"))]
pub mod simulated;

pub use chain_client::*;
#[cfg(any(test, feature = "testing"))]
pub use simulated::SimulatedChain;
