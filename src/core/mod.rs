pub mod context;
pub mod pool;

pub use context::Context;
pub use pool::{PoolError, Reservation, TaskError, TaskHandle, WorkerPool};
