use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use crate::crawler::context::Context;
use crate::crawler::engine::EngineHandle;
use crate::crawler::scheduler::Item;
use crate::crawler::task::Task;
use crate::error::CrawlError;
use crate::http::Request;

/// Outcome of one hook in a chain
#[derive(Debug, Clone, PartialEq)]
pub enum Flow<T> {
    /// Hand the (possibly modified) value to the next hook
    Continue(T),
    /// Drop the value and skip the rest of the chain
    Stop,
}

impl<T> Flow<T> {
    pub fn is_stop(&self) -> bool {
        matches!(self, Flow::Stop)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Flow::Continue(value) => Some(value),
            Flow::Stop => None,
        }
    }
}

impl<T> From<Option<T>> for Flow<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Flow::Continue(value),
            None => Flow::Stop,
        }
    }
}

pub type LifecycleHook = Arc<dyn Fn(&EngineHandle) + Send + Sync>;
pub type AddHook = Arc<dyn Fn(Option<&Context>, Task) -> Flow<Task> + Send + Sync>;
pub type ReqHook = Arc<dyn Fn(&mut Context, Request) -> Flow<Request> + Send + Sync>;
pub type RespHook = Arc<dyn Fn(&mut Context) + Send + Sync>;
pub type ItemHook = Arc<dyn Fn(Item) -> Flow<Item> + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&mut Context, &CrawlError) + Send + Sync>;

/// Ordered hook lists, one per lifecycle point
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) start: Vec<LifecycleHook>,
    pub(crate) finish: Vec<LifecycleHook>,
    pub(crate) add: Vec<AddHook>,
    pub(crate) req: Vec<ReqHook>,
    pub(crate) resp: Vec<RespHook>,
    pub(crate) item: Vec<ItemHook>,
    pub(crate) error: Vec<ErrorHook>,
}

impl Hooks {
    pub fn run_start(&self, engine: &EngineHandle) {
        for hook in &self.start {
            hook(engine);
        }
    }

    pub fn run_finish(&self, engine: &EngineHandle) {
        for hook in &self.finish {
            hook(engine);
        }
    }

    /// `ctx` is the producing task, `None` for tasks added from outside
    pub fn run_add(&self, ctx: Option<&Context>, mut task: Task) -> Flow<Task> {
        for hook in &self.add {
            match hook(ctx, task) {
                Flow::Continue(next) => task = next,
                Flow::Stop => {
                    trace!("Task dropped by add hook");
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue(task)
    }

    pub fn run_req(&self, ctx: &mut Context, mut request: Request) -> Flow<Request> {
        for hook in &self.req {
            match hook(ctx, request) {
                Flow::Continue(next) => request = next,
                Flow::Stop => return Flow::Stop,
            }
        }
        Flow::Continue(request)
    }

    /// Stops early once the context is aborted
    pub fn run_resp(&self, ctx: &mut Context) {
        for hook in &self.resp {
            if ctx.is_aborted() {
                return;
            }
            hook(ctx);
        }
    }

    pub fn run_item(&self, mut item: Item) -> Flow<Item> {
        for hook in &self.item {
            match hook(item) {
                Flow::Continue(next) => item = next,
                Flow::Stop => return Flow::Stop,
            }
        }
        Flow::Continue(item)
    }

    /// Each hook runs once per failure; a panicking hook does not stop the
    /// others. Returns the number of hooks that panicked.
    pub fn run_error(&self, ctx: &mut Context, err: &CrawlError) -> usize {
        let mut panicked = 0;
        for hook in &self.error {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| hook(ctx, err))) {
                error!("Error hook panicked while handling {}: {}", err, panic_message(panic.as_ref()));
                panicked += 1;
            }
        }
        panicked
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
