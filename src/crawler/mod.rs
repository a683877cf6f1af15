pub mod context;
pub mod engine;
pub mod hooks;
pub mod pool;
pub mod scheduler;
pub mod task;

pub use context::Context;
pub use engine::{Engine, EngineHandle, Extension};
pub use hooks::{Flow, Hooks};
pub use pool::WorkerPool;
pub use scheduler::{Item, MemoryScheduler, Scheduler, SchedulerOrder};
pub use task::{handler, Handler, Task};
