pub mod backend;
pub mod change_listener;
pub mod config;
pub mod error;
pub mod memory;
pub mod models;
pub mod mutator;
pub mod query_cache;
pub mod realtime;
pub mod session;
pub mod sync;
pub mod telemetry;

pub use change_listener::ChangeListener;
pub use config::FeedConfig;
pub use error::{FeedError, FeedResult};
pub use memory::MemoryPlatform;
pub use mutator::OptimisticMutator;
pub use query_cache::{FeedSnapshot, QueryCache};
pub use sync::{FeedServices, FeedSync};
