//! A pipelining layer-7 proxy for memcached and Redis: many client
//! connections multiplex onto small pools of backend connections, with
//! consistent-hash sharding, multi-key fragmentation, failure ejection and
//! per-request deadlines.

pub mod backend;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod pool;
pub mod session;
pub mod stats;

pub use config::{load as load_config, PoolSettings};
pub use error::{Error, Failure};
pub use pool::Pool;
pub use stats::Stats;
