use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use scraper::{ElementRef, Selector};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, trace, warn, Dispatch};

use crate::config::CrawlerConfig;
use crate::crawler::context::Context;
use crate::crawler::hooks::{panic_message, Flow, Hooks};
use crate::crawler::pool::WorkerPool;
use crate::crawler::scheduler::{Item, MemoryScheduler, Scheduler, SchedulerOrder};
use crate::crawler::task::{Handler, Task};
use crate::error::CrawlError;
use crate::http::{Downloader, HttpDownloader, HttpOptions, Middleware, Request};
use crate::limiter::Limiter;
use crate::utils::metrics::{CrawlStats, StatsSnapshot};

/// Something that configures an engine: hooks, middleware, a scheduler
pub trait Extension {
    fn install(self, engine: &mut Engine);
}

impl<F> Extension for F
where
    F: FnOnce(&mut Engine),
{
    fn install(self, engine: &mut Engine) {
        self(engine)
    }
}

/// The crawl orchestrator
///
/// Tasks are pulled from the scheduler into a bounded task pool. Each
/// worker runs the request hooks, the download, the response hooks and the
/// task's handlers, then feeds the tasks and items it produced back into
/// the scheduler. A second loop drains items into the item pool.
pub struct Engine {
    scheduler: Option<Arc<dyn Scheduler>>,
    order: SchedulerOrder,
    downloader: Option<Box<dyn Downloader>>,
    http: HttpOptions,
    middlewares: Vec<Arc<dyn Middleware>>,
    hooks: Hooks,
    auto_stop: bool,
    idle_timeout: Duration,
    poll_interval: Duration,
    dispatch: Dispatch,
    inbox: mpsc::UnboundedReceiver<Task>,
    handle: EngineHandle,
}

/// Cloneable control surface of a running (or not yet started) engine
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

struct Shared {
    inbox: mpsc::UnboundedSender<Task>,
    task_pool: Arc<WorkerPool>,
    item_pool: Arc<WorkerPool>,
    stats: CrawlStats,
    stopping: AtomicBool,
    draining: AtomicBool,
    finished: AtomicBool,
    stop: Notify,
    items_ready: Notify,
}

/// Everything a worker needs once the engine is running
struct Runtime {
    scheduler: Arc<dyn Scheduler>,
    downloader: Arc<dyn Downloader>,
    hooks: Hooks,
    handle: EngineHandle,
    poll_interval: Duration,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let cores = num_cpus::get().max(1);
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            scheduler: None,
            order: SchedulerOrder::BreadthFirst,
            downloader: None,
            http: HttpOptions::default(),
            middlewares: Vec::new(),
            hooks: Hooks::default(),
            auto_stop: true,
            idle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            dispatch: Dispatch::none(),
            inbox: rx,
            handle: EngineHandle {
                shared: Arc::new(Shared {
                    inbox: tx,
                    task_pool: WorkerPool::new("task", cores * 2),
                    item_pool: WorkerPool::new("item", cores),
                    stats: CrawlStats::new(),
                    stopping: AtomicBool::new(false),
                    draining: AtomicBool::new(false),
                    finished: AtomicBool::new(false),
                    stop: Notify::new(),
                    items_ready: Notify::new(),
                }),
            },
        }
    }

    /// Build an engine from a loaded configuration
    pub fn from_config(config: &CrawlerConfig) -> Result<Self, CrawlError> {
        let settings = &config.engine;
        let mut engine = Self::new();

        engine.set_auto_stop(settings.auto_stop);
        engine.set_idle_timeout(Duration::from_millis(settings.idle_timeout_ms));
        engine.set_http_options(config.http.options());
        if settings.depth_first {
            engine.depth_first();
        }
        if let Some(size) = settings.task_pool_size {
            engine.set_task_pool_size(size);
        }
        if let Some(size) = settings.item_pool_size {
            engine.set_item_pool_size(size);
        }

        if config.limiter.whitelist || !config.limiter.rules.is_empty() {
            let limiter = Limiter::from_settings(&config.limiter)?;
            engine.install(limiter);
        }

        Ok(engine)
    }

    pub fn with(mut self, extension: impl Extension) -> Self {
        extension.install(&mut self);
        self
    }

    pub fn install(&mut self, extension: impl Extension) -> &mut Self {
        extension.install(self);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn set_scheduler(&mut self, scheduler: Arc<dyn Scheduler>) -> &mut Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Replace the HTTP downloader. Middleware added through the engine is
    /// attached to whichever downloader is in place when the run starts.
    pub fn set_downloader(&mut self, downloader: impl Downloader + 'static) -> &mut Self {
        self.downloader = Some(Box::new(downloader));
        self
    }

    /// Options for the default HTTP downloader
    pub fn set_http_options(&mut self, options: HttpOptions) -> &mut Self {
        self.http = options;
        self
    }

    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    /// Pop the newest task first (applies to the default scheduler)
    pub fn depth_first(&mut self) -> &mut Self {
        self.order = SchedulerOrder::DepthFirst;
        self
    }

    /// Stop once the queue and the task pool are empty. When disabled, the
    /// engine keeps waiting for tasks until [`EngineHandle::stop`] is called.
    pub fn set_auto_stop(&mut self, auto_stop: bool) -> &mut Self {
        self.auto_stop = auto_stop;
        self
    }

    pub fn set_task_pool_size(&mut self, size: usize) -> &mut Self {
        self.handle.set_task_pool_size(size);
        self
    }

    pub fn set_item_pool_size(&mut self, size: usize) -> &mut Self {
        self.handle.set_item_pool_size(size);
        self
    }

    /// Longest wait between queue checks while idle without auto-stop
    pub fn set_idle_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn set_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval = interval;
        self
    }

    /// Route the engine's logs to `dispatch`. Silent by default.
    pub fn set_logger(&mut self, dispatch: Dispatch) -> &mut Self {
        self.dispatch = dispatch;
        self
    }

    pub fn add_task(&self, request: Request, handlers: Vec<Handler>) -> Result<(), CrawlError> {
        self.handle.add_task(request, handlers)
    }

    pub fn on_start<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&EngineHandle) + Send + Sync + 'static,
    {
        self.hooks.start.push(Arc::new(f));
        self
    }

    pub fn on_finish<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&EngineHandle) + Send + Sync + 'static,
    {
        self.hooks.finish.push(Arc::new(f));
        self
    }

    pub fn on_add<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Option<&Context>, Task) -> Flow<Task> + Send + Sync + 'static,
    {
        self.hooks.add.push(Arc::new(f));
        self
    }

    pub fn on_req<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Context, Request) -> Flow<Request> + Send + Sync + 'static,
    {
        self.hooks.req.push(Arc::new(f));
        self
    }

    pub fn on_resp<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.hooks.resp.push(Arc::new(f));
        self
    }

    pub fn on_item<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Item) -> Flow<Item> + Send + Sync + 'static,
    {
        self.hooks.item.push(Arc::new(f));
        self
    }

    pub fn on_error<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&mut Context, &CrawlError) + Send + Sync + 'static,
    {
        self.hooks.error.push(Arc::new(f));
        self
    }

    /// Call `f` for every element matching `selector` in HTML responses
    pub fn on_html<F>(&mut self, selector: &str, f: F) -> Result<&mut Self, CrawlError>
    where
        F: Fn(&mut Context, ElementRef<'_>) + Send + Sync + 'static,
    {
        let selector = Selector::parse(selector)
            .map_err(|e| CrawlError::Config(format!("invalid selector {:?}: {:?}", selector, e)))?;

        Ok(self.on_resp(move |ctx| {
            let Some(doc) = ctx.response().filter(|r| r.is_html()).map(|r| r.html()) else {
                return;
            };
            for element in doc.select(&selector) {
                if ctx.is_aborted() {
                    break;
                }
                f(ctx, element);
            }
        }))
    }

    /// Call `f` with the value at `pointer` in JSON responses
    pub fn on_json<F>(&mut self, pointer: &str, f: F) -> &mut Self
    where
        F: Fn(&mut Context, &Value) + Send + Sync + 'static,
    {
        let pointer = pointer.to_string();
        self.on_resp(move |ctx| {
            let value = ctx
                .response()
                .filter(|r| r.is_json())
                .and_then(|r| r.json_pointer(&pointer))
                .cloned();
            if let Some(value) = value {
                f(ctx, &value);
            }
        })
    }

    /// Run until the crawl drains (auto-stop) or [`EngineHandle::stop`] is called
    pub async fn run(self) -> Result<(), CrawlError> {
        let dispatch = self.dispatch.clone();
        self.run_inner().with_subscriber(dispatch).await
    }

    async fn run_inner(self) -> Result<(), CrawlError> {
        let Engine {
            scheduler,
            order,
            downloader,
            http,
            middlewares,
            hooks,
            auto_stop,
            idle_timeout,
            poll_interval,
            mut inbox,
            handle,
            ..
        } = self;

        let scheduler = scheduler.unwrap_or_else(|| Arc::new(MemoryScheduler::new(order)));
        let mut downloader = match downloader {
            Some(downloader) => downloader,
            None => Box::new(HttpDownloader::new(http)?),
        };
        for middleware in middlewares {
            downloader.add_middleware(middleware);
        }

        let rt = Arc::new(Runtime {
            scheduler,
            downloader: Arc::from(downloader),
            hooks,
            handle: handle.clone(),
            poll_interval,
        });
        let shared = &handle.shared;
        shared.stats.restart();

        info!(
            "Engine started with {} task workers and {} item workers",
            shared.task_pool.capacity(),
            shared.item_pool.capacity()
        );
        rt.hooks.run_start(&handle);

        let items = tokio::spawn(rt.clone().item_loop().with_current_subscriber());
        let result = rt.task_loop(&mut inbox, auto_stop, idle_timeout).await;

        inbox.close();
        shared.finished.store(true, Ordering::SeqCst);
        while let Ok(task) = inbox.try_recv() {
            warn!("Engine stopped before running {}", task.request);
            shared.stats.record_task_dropped();
        }
        shared.task_pool.wait_idle().await;

        shared.draining.store(true, Ordering::SeqCst);
        shared.items_ready.notify_one();
        if let Err(e) = items.await {
            error!("Item loop failed: {}", e);
        }

        shared.task_pool.release();
        shared.item_pool.release();
        rt.hooks.run_finish(&handle);

        let stats = shared.stats.snapshot();
        info!(
            "Engine finished: {} requests, {} responses, {} errors, {} items in {:.1}s",
            stats.requests, stats.responses, stats.errors, stats.items_processed, stats.elapsed_secs
        );
        result
    }
}

impl EngineHandle {
    /// Queue a root task. Fails once the engine has finished.
    pub fn add_task(&self, request: Request, handlers: Vec<Handler>) -> Result<(), CrawlError> {
        if self.shared.finished.load(Ordering::SeqCst) {
            return Err(CrawlError::PoolClosed("task"));
        }
        self.shared
            .inbox
            .send(Task::new(request, handlers))
            .map_err(|_| CrawlError::PoolClosed("task"))
    }

    /// Ask the run loop to stop; tasks already executing are allowed to finish
    pub fn stop(&self) {
        info!("Engine stop requested");
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.stop.notify_one();
    }

    pub fn set_task_pool_size(&self, size: usize) {
        self.shared.task_pool.tune(size.max(1));
    }

    pub fn set_item_pool_size(&self, size: usize) {
        self.shared.item_pool.tune(size);
    }

    pub fn running_tasks(&self) -> usize {
        self.shared.task_pool.running()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Runtime {
    fn stats(&self) -> &CrawlStats {
        &self.handle.shared.stats
    }

    async fn task_loop(
        self: &Arc<Self>,
        inbox: &mut mpsc::UnboundedReceiver<Task>,
        auto_stop: bool,
        idle_timeout: Duration,
    ) -> Result<(), CrawlError> {
        let shared = &self.handle.shared;
        let pool = &shared.task_pool;
        let mut inbox_closed = false;

        loop {
            if shared.stopping.load(Ordering::SeqCst) {
                debug!("Task loop stopping");
                break;
            }
            while let Ok(task) = inbox.try_recv() {
                self.admit_root(task).await;
            }

            let changed = pool.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if pool.free() > 0 {
                match self.scheduler.get_task().await {
                    Ok(Some(task)) => {
                        let worker = self.clone();
                        pool.submit(async move { worker.execute(task).await })?;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Failed to pop task: {}", e),
                }

                if pool.running() == 0 && self.scheduler.is_task_empty().await {
                    if auto_stop {
                        // Refuse new roots first so none can slip in after the last check
                        inbox.close();
                        inbox_closed = true;
                        let mut late = false;
                        while let Ok(task) = inbox.try_recv() {
                            self.admit_root(task).await;
                            late = true;
                        }
                        if late {
                            continue;
                        }
                        debug!("Task queue drained");
                        break;
                    }

                    trace!("Idle, waiting up to {:?} for new tasks", idle_timeout);
                    tokio::select! {
                        task = inbox.recv() => {
                            if let Some(task) = task {
                                self.admit_root(task).await;
                            }
                        }
                        _ = shared.stop.notified() => {}
                        _ = tokio::time::sleep(idle_timeout) => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = &mut changed => {}
                task = inbox.recv(), if !inbox_closed => {
                    if let Some(task) = task {
                        self.admit_root(task).await;
                    }
                }
                _ = shared.stop.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        pool.wait_idle().await;
        Ok(())
    }

    async fn item_loop(self: Arc<Self>) {
        let shared = &self.handle.shared;
        let pool = &shared.item_pool;

        loop {
            let changed = pool.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let draining = shared.draining.load(Ordering::SeqCst);
            if pool.free() > 0 {
                match self.scheduler.get_item().await {
                    Ok(Some(item)) => {
                        let worker = self.clone();
                        if let Err(e) = pool.submit(async move { worker.process_item(item) }) {
                            error!("Dropping item: {}", e);
                            break;
                        }
                        continue;
                    }
                    Ok(None) if draining => break,
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Failed to pop item: {}", e);
                        if draining {
                            break;
                        }
                    }
                }
            } else if draining && pool.capacity() == 0 {
                warn!("Item pool has no workers, leaving queued items unprocessed");
                break;
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = shared.items_ready.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        pool.wait_idle().await;
    }

    /// Resolve and admit a task added from outside the engine
    async fn admit_root(&self, mut task: Task) {
        task.request.resolve(None);
        if task.request.get_depth().is_none() {
            task.request.set_depth(Some(1));
        }
        let admitted = self.hooks.run_add(None, task);
        self.enqueue(admitted).await;
    }

    async fn enqueue(&self, admitted: Flow<Task>) {
        match admitted {
            Flow::Continue(task) => {
                self.stats().record_task_added();
                if let Err(e) = self.scheduler.add_task(task).await {
                    warn!("Failed to queue task: {}", e);
                }
            }
            Flow::Stop => self.stats().record_task_dropped(),
        }
    }

    async fn execute(self: Arc<Self>, task: Task) {
        let Task { request, handlers } = task;
        let mut ctx = Context::new(request.clone(), handlers);
        trace!("Executing {}", request);

        if let Err(panic) = AssertUnwindSafe(self.process(&mut ctx, request))
            .catch_unwind()
            .await
        {
            self.report_panic(&mut ctx, panic);
        }
        if let Err(panic) = AssertUnwindSafe(self.reconcile(&mut ctx))
            .catch_unwind()
            .await
        {
            self.report_panic(&mut ctx, panic);
        }
    }

    async fn process(&self, ctx: &mut Context, request: Request) {
        let request = match self.hooks.run_req(ctx, request) {
            Flow::Continue(request) => request,
            Flow::Stop => {
                trace!("Request {} dropped by request hook", ctx.request());
                return;
            }
        };
        ctx.set_request(request.clone());

        if let Err(e) = request.check() {
            self.fail(ctx, CrawlError::Request(e));
            return;
        }

        self.stats().record_request();
        match self.downloader.download(request).await {
            Ok(response) => {
                self.stats().record_response();
                ctx.set_response(response);
                self.hooks.run_resp(ctx);

                let handlers = ctx.handlers().to_vec();
                for handler in &handlers {
                    if ctx.is_aborted() {
                        trace!("Task {} aborted", ctx.id());
                        break;
                    }
                    handler(ctx);
                }
            }
            Err(e) => {
                if let Some(partial) = e.as_downloader().and_then(|d| d.response.clone()) {
                    ctx.set_response(partial);
                }
                self.fail(ctx, e);
            }
        }
    }

    /// Drain the context's output back into the scheduler
    async fn reconcile(&self, ctx: &mut Context) {
        let tasks = ctx.take_tasks();
        if !tasks.is_empty() {
            let base = ctx
                .response()
                .map(|r| r.url().clone())
                .or_else(|| ctx.request().url().cloned());
            let depth = ctx.request().get_depth().unwrap_or(1) + 1;

            for mut task in tasks {
                task.request.resolve(base.as_ref());
                if task.request.get_depth().is_none() {
                    task.request.set_depth(Some(depth));
                }
                let admitted = self.hooks.run_add(Some(&*ctx), task);
                self.enqueue(admitted).await;
            }
        }

        let items = ctx.take_items();
        if !items.is_empty() {
            self.stats().record_items_emitted(items.len());
            for item in items {
                if let Err(e) = self.scheduler.add_item(item).await {
                    warn!("Failed to queue item: {}", e);
                }
            }
            self.handle.shared.items_ready.notify_one();
        }
    }

    fn process_item(&self, item: Item) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.hooks.run_item(item))) {
            Ok(Flow::Continue(_)) => self.stats().record_item_processed(),
            Ok(Flow::Stop) => trace!("Item dropped by item hook"),
            Err(panic) => {
                self.stats().record_panic();
                error!("Item hook panicked: {}", panic_message(panic.as_ref()));
            }
        }
    }

    fn fail(&self, ctx: &mut Context, err: CrawlError) {
        debug!("Task {} failed: {}", ctx.request(), err);
        self.stats().record_error();
        self.run_error_hooks(ctx, &err);
    }

    fn run_error_hooks(&self, ctx: &mut Context, err: &CrawlError) {
        for _ in 0..self.hooks.run_error(ctx, err) {
            self.stats().record_panic();
        }
    }

    fn report_panic(&self, ctx: &mut Context, panic: Box<dyn Any + Send>) {
        let message = panic_message(panic.as_ref());
        error!("Task {} panicked: {}", ctx.request(), message);
        self.stats().record_panic();

        self.run_error_hooks(ctx, &CrawlError::Panic(message));
    }
}
