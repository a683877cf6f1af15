pub mod queue;

pub use queue::{ItemManager, QueuedRequest, RedisScheduler};
