//! A hook-driven concurrent crawling engine
//!
//! An [`Engine`] pulls tasks from a [`Scheduler`], downloads them through a
//! middleware chain and hands each response to the task's handlers, which
//! emit follow-up tasks and items. Behaviour is layered on through hooks,
//! middleware and [`Extension`]s such as the per-host [`Limiter`].

pub mod config;
pub mod crawler;
pub mod error;
pub mod extensions;
pub mod http;
pub mod limiter;
#[cfg(feature = "distributed")]
pub mod storage;
pub mod utils;

pub use config::CrawlerConfig;
pub use crawler::{
    handler, Context, Engine, EngineHandle, Extension, Flow, Handler, Item, MemoryScheduler, Scheduler,
    SchedulerOrder, Task,
};
pub use error::{CrawlError, DownloaderError, RequestError, TransportError};
pub use http::{Downloader, HttpDownloader, HttpOptions, Meta, Middleware, Next, Request, Response};
pub use limiter::{LimitRule, Limiter, LimiterSettings, Policy};
