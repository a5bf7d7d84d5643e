pub mod expiring;
pub mod safe;

pub use expiring::{ExpiringCache, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
pub use safe::{CacheError, SafeCache};
