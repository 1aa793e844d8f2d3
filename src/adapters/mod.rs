pub mod registry_probe;
pub mod traits;

pub use registry_probe::RegistryProbeCollector;
pub use traits::*;
