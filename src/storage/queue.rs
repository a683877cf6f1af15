use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::crawler::{Flow, Handler, Hooks, Item, MemoryScheduler, Scheduler, Task, WorkerPool};
use crate::error::CrawlError;
use crate::extensions::dedup::fingerprint;
use crate::http::{Meta, Request};

/// Map backend failures into [`CrawlError::Queue`] with a short description
trait QueueContext<T> {
    fn context(self, msg: &str) -> Result<T, CrawlError>;
}

impl<T, E: std::fmt::Display> QueueContext<T> for Result<T, E> {
    fn context(self, msg: &str) -> Result<T, CrawlError> {
        self.map_err(|e| CrawlError::Queue(format!("{}: {}", msg, e)))
    }
}

/// Wire form of a queued request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub meta: Meta,
}

impl QueuedRequest {
    /// Only requests with an absolute URL and no construction error can be queued
    pub fn from_request(request: &Request) -> Result<Self, CrawlError> {
        let url = request.check()?;
        Ok(Self {
            method: request.method().to_string(),
            url: url.to_string(),
            headers: request
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect(),
            body: request.body().to_vec(),
            depth: request.get_depth(),
            proxy: request.get_proxy().map(str::to_string),
            meta: request.meta().clone(),
        })
    }

    pub fn into_request(self) -> Result<Request, CrawlError> {
        let method = Method::from_bytes(self.method.as_bytes())
            .context(&format!("Invalid method {:?} in queued request", self.method))?;

        let mut request = Request::new(method, &self.url)
            .with_body(self.body)
            .with_meta(self.meta);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request.set_depth(self.depth);
        request.set_proxy(self.proxy);
        Ok(request)
    }
}

struct Keys {
    tasks: String,
    items: String,
    deduplicate: String,
}

impl Keys {
    fn new(name: &str) -> Self {
        Self {
            tasks: format!("{}_tasks", name),
            items: format!("{}_items", name),
            deduplicate: format!("{}_deduplicate", name),
        }
    }
}

async fn open(settings: &QueueSettings) -> Result<Arc<Mutex<MultiplexedConnection>>, CrawlError> {
    let client = Client::open(settings.redis_url.clone())
        .context(&format!("Failed to connect to Redis at {}", settings.redis_url))?;
    let conn = client
        .get_multiplexed_async_connection()
        .await
        .context("Failed to get Redis connection")?;
    Ok(Arc::new(Mutex::new(conn)))
}

async fn push_request(
    conn: &Mutex<MultiplexedConnection>,
    key: &str,
    ttl: Option<u64>,
    request: &Request,
) -> Result<(), CrawlError> {
    let json = serde_json::to_string(&QueuedRequest::from_request(request)?)
        .context("Failed to serialize request")?;

    let mut conn = conn.lock().await;
    redis::cmd("LPUSH")
        .arg(key)
        .arg(&json)
        .query_async::<_, ()>(&mut *conn)
        .await
        .context("Failed to push request to Redis queue")?;

    if let Some(ttl) = ttl {
        let current: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .unwrap_or(-1);
        if current == -1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl)
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to set TTL on queue")?;
        }
    }

    debug!("Pushed request to queue: {}", request);
    Ok(())
}

/// A scheduler that shares its task queue through Redis
///
/// Tasks produced locally are run locally. When the local buffer runs dry,
/// a batch of requests is pulled from the shared list and paired with the
/// seed handlers, so every worker process must register the same handlers.
pub struct RedisScheduler {
    conn: Arc<Mutex<MultiplexedConnection>>,
    keys: Keys,
    settings: QueueSettings,
    local: MemoryScheduler,
    seed_handlers: Vec<Handler>,
}

impl RedisScheduler {
    pub async fn connect(settings: QueueSettings, seed_handlers: Vec<Handler>) -> Result<Self, CrawlError> {
        let conn = open(&settings).await?;
        info!("Connected to Redis queue {}", settings.name);

        Ok(Self {
            conn,
            keys: Keys::new(&settings.name),
            settings,
            local: MemoryScheduler::default(),
            seed_handlers,
        })
    }

    /// Push a seed request onto the shared queue
    pub async fn push_request(&self, request: &Request) -> Result<(), CrawlError> {
        push_request(&self.conn, &self.keys.tasks, self.settings.task_ttl, request).await
    }

    /// Whether the request has not been queued anywhere yet
    async fn first_seen(&self, request: &Request) -> Result<bool, CrawlError> {
        let mut conn = self.conn.lock().await;
        let added: i64 = redis::cmd("SADD")
            .arg(&self.keys.deduplicate)
            .arg(fingerprint(request))
            .query_async(&mut *conn)
            .await
            .context("Failed to record request fingerprint")?;
        Ok(added > 0)
    }

    async fn pull_batch(&self) -> Result<usize, CrawlError> {
        let mut pulled = Vec::new();
        {
            let mut conn = self.conn.lock().await;
            for _ in 0..self.settings.batch_size.max(1) {
                let json: Option<String> = redis::cmd("RPOP")
                    .arg(&self.keys.tasks)
                    .query_async(&mut *conn)
                    .await
                    .context("Failed to pop request from Redis queue")?;
                match json {
                    Some(json) => pulled.push(json),
                    None => break,
                }
            }
        }

        let mut count = 0;
        for json in pulled {
            let request = serde_json::from_str::<QueuedRequest>(&json)
                .context("Failed to deserialize request")
                .and_then(QueuedRequest::into_request);
            match request {
                Ok(request) => {
                    self.local
                        .add_task(Task::new(request, self.seed_handlers.clone()))
                        .await?;
                    count += 1;
                }
                Err(e) => warn!("Skipping queued request: {}", e),
            }
        }
        if count > 0 {
            debug!("Pulled {} requests from {}", count, self.keys.tasks);
        }
        Ok(count)
    }
}

#[async_trait]
impl Scheduler for RedisScheduler {
    async fn add_task(&self, task: Task) -> Result<(), CrawlError> {
        if self.settings.deduplicate
            && task.request.meta().retry_times == 0
            && !self.first_seen(&task.request).await?
        {
            debug!("Skipping already queued request: {}", task.request);
            return Ok(());
        }
        self.local.add_task(task).await
    }

    async fn get_task(&self) -> Result<Option<Task>, CrawlError> {
        if let Some(task) = self.local.get_task().await? {
            return Ok(Some(task));
        }
        if self.pull_batch().await? == 0 {
            return Ok(None);
        }
        self.local.get_task().await
    }

    async fn add_item(&self, item: Item) -> Result<(), CrawlError> {
        let json = serde_json::to_string(&item).context("Failed to serialize item")?;
        {
            let mut conn = self.conn.lock().await;
            redis::cmd("LPUSH")
                .arg(&self.keys.items)
                .arg(&json)
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to push item to Redis queue")?;
        }
        self.local.add_item(item).await
    }

    async fn get_item(&self) -> Result<Option<Item>, CrawlError> {
        self.local.get_item().await
    }

    async fn is_task_empty(&self) -> bool {
        if !self.local.is_task_empty().await {
            return false;
        }
        let mut conn = self.conn.lock().await;
        let pending: Result<usize, _> = redis::cmd("LLEN")
            .arg(&self.keys.tasks)
            .query_async(&mut *conn)
            .await;
        match pending {
            Ok(n) => n == 0,
            Err(e) => {
                warn!("Failed to get queue length: {}", e);
                true
            }
        }
    }

    async fn is_item_empty(&self) -> bool {
        self.local.is_item_empty().await
    }
}

/// Consumer side of a distributed crawl: processes items pushed by workers
/// and seeds their shared task queue
pub struct ItemManager {
    conn: Arc<Mutex<MultiplexedConnection>>,
    keys: Keys,
    settings: QueueSettings,
    hooks: Hooks,
    pool: Arc<WorkerPool>,
    poll_interval: Duration,
    stopping: AtomicBool,
    stop: Notify,
}

impl ItemManager {
    pub async fn connect(settings: QueueSettings) -> Result<Self, CrawlError> {
        let conn = open(&settings).await?;
        Ok(Self {
            conn,
            keys: Keys::new(&settings.name),
            settings,
            hooks: Hooks::default(),
            pool: WorkerPool::new("item", num_cpus::get().max(1)),
            poll_interval: Duration::from_millis(200),
            stopping: AtomicBool::new(false),
            stop: Notify::new(),
        })
    }

    pub fn on_item<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Item) -> Flow<Item> + Send + Sync + 'static,
    {
        self.hooks.item.push(Arc::new(f));
        self
    }

    pub fn set_item_pool_size(&self, size: usize) {
        self.pool.tune(size);
    }

    pub fn set_poll_interval(&mut self, interval: Duration) -> &mut Self {
        self.poll_interval = interval;
        self
    }

    /// Seed the shared task queue
    pub async fn send_request(&self, request: &Request) -> Result<(), CrawlError> {
        push_request(&self.conn, &self.keys.tasks, self.settings.task_ttl, request).await
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.notify_one();
    }

    async fn pop_item(&self) -> Result<Option<Item>, CrawlError> {
        let mut conn = self.conn.lock().await;
        let json: Option<String> = redis::cmd("RPOP")
            .arg(&self.keys.items)
            .query_async(&mut *conn)
            .await
            .context("Failed to pop item from Redis queue")?;
        json.map(|json| serde_json::from_str(&json).context("Failed to deserialize item"))
            .transpose()
    }

    /// Process items until [`ItemManager::stop`] is called
    pub async fn run(&self) -> Result<(), CrawlError> {
        {
            let mut conn = self.conn.lock().await;
            redis::cmd("DEL")
                .arg(&self.keys.deduplicate)
                .query_async::<_, ()>(&mut *conn)
                .await
                .context("Failed to reset deduplication set")?;
        }
        info!("Item manager consuming {}", self.keys.items);

        while !self.stopping.load(Ordering::SeqCst) {
            let changed = self.pool.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.pool.free() > 0 {
                match self.pop_item().await {
                    Ok(Some(item)) => {
                        let hooks = self.hooks.clone();
                        self.pool.submit(async move {
                            if hooks.run_item(item).is_stop() {
                                debug!("Item dropped by item hook");
                            }
                        })?;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => error!("{}", e),
                }
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = self.stop.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.pool.wait_idle().await;
        self.pool.release();
        info!("Item manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queued_request_keeps_crawl_state() {
        let mut meta = Meta::default();
        meta.retry_times = 2;
        meta.insert("category", "books");

        let request = Request::post_json("http://example.com/api", &serde_json::json!({"q": 1}))
            .header("x-token", "abc")
            .proxy("socks5://127.0.0.1:9050")
            .depth(3)
            .with_meta(meta);

        let wire = serde_json::to_string(&QueuedRequest::from_request(&request).unwrap()).unwrap();
        let restored = serde_json::from_str::<QueuedRequest>(&wire)
            .unwrap()
            .into_request()
            .unwrap();

        assert_eq!(*restored.method(), Method::POST);
        assert_eq!(restored.url(), request.url());
        assert_eq!(restored.body(), br#"{"q":1}"#);
        assert_eq!(restored.headers().get("x-token").unwrap(), "abc");
        assert_eq!(restored.headers().get("content-type").unwrap(), "application/json");
        assert_eq!(restored.get_depth(), Some(3));
        assert_eq!(restored.get_proxy(), Some("socks5://127.0.0.1:9050"));
        assert_eq!(restored.meta().retry_times, 2);
        assert_eq!(restored.meta().get_as::<String>("category").as_deref(), Some("books"));
    }

    #[test]
    fn test_unresolved_requests_cannot_be_queued() {
        assert!(QueuedRequest::from_request(&Request::get("/relative")).is_err());

        let bad = QueuedRequest {
            method: "NOT A METHOD".to_string(),
            url: "http://example.com".to_string(),
            headers: vec![],
            body: vec![],
            depth: None,
            proxy: None,
            meta: Meta::default(),
        };
        assert!(matches!(bad.into_request(), Err(CrawlError::Queue(_))));
    }

    #[test]
    fn test_key_layout() {
        let keys = Keys::new("books");
        assert_eq!(keys.tasks, "books_tasks");
        assert_eq!(keys.items, "books_items");
        assert_eq!(keys.deduplicate, "books_deduplicate");
    }
}
