pub mod artifact_store;
pub mod block_resolver;
pub mod checkpoint;
pub mod connection_pool;
pub mod deployment_probe;
pub mod harvester;
pub mod rate_limiter;
pub mod status;
pub mod task_graph;
pub mod worker_pool;

pub use artifact_store::*;
pub use block_resolver::*;
pub use checkpoint::*;
pub use connection_pool::*;
pub use deployment_probe::*;
pub use harvester::*;
pub use rate_limiter::*;
pub use status::*;
pub use task_graph::*;
pub use worker_pool::*;
