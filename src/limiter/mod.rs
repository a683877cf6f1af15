//! Per-destination throttling and admission quotas
//!
//! A [`Limiter`] installs two things into an engine: a downloader
//! middleware that delays, rate-limits or caps the parallelism of matching
//! requests, and an add hook that enforces allow/deny policies, depth limits
//! and request quotas before a task is ever scheduled.

pub mod rule;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::crawler::{Engine, Extension, Flow, Task};
use crate::error::CrawlError;
use crate::http::{Middleware, Next, Request, Response};

pub use rule::{LimitRule, Policy};
use rule::{CompiledRule, Throttle};

/// Serializable limiter configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    /// Reject tasks matching no rule
    pub whitelist: bool,
    pub rules: Vec<LimitRule>,
}

pub struct Limiter {
    state: Arc<LimiterState>,
}

struct LimiterState {
    whitelist: bool,
    rules: Vec<CompiledRule>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Limiter {
    /// Rules are evaluated in order; the first one matching a host applies
    pub fn new(whitelist: bool, rules: Vec<LimitRule>) -> Result<Self, CrawlError> {
        let rules = rules
            .iter()
            .map(LimitRule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            state: Arc::new(LimiterState {
                whitelist,
                rules,
                ticker: Mutex::new(None),
            }),
        })
    }

    pub fn from_settings(settings: &LimiterSettings) -> Result<Self, CrawlError> {
        Self::new(settings.whitelist, settings.rules.clone())
    }

    /// The throttling middleware on its own, for use outside an engine
    pub fn middleware(&self) -> Arc<dyn Middleware> {
        Arc::new(LimitMiddleware(self.state.clone()))
    }

    /// Whether a task passes the policy, depth and quota checks. Consumes
    /// one unit of the matching rule's request quota when it does.
    pub fn admit(&self, task: &Task) -> bool {
        self.state.admit(task)
    }
}

impl Extension for Limiter {
    fn install(self, engine: &mut Engine) {
        let state = self.state;
        engine.add_middleware(Arc::new(LimitMiddleware(state.clone())));

        let admission = state.clone();
        engine.on_add(move |_, task| {
            if admission.admit(&task) {
                Flow::Continue(task)
            } else {
                Flow::Stop
            }
        });

        let ticker = state.clone();
        engine.on_start(move |_| ticker.start_ticker());
        engine.on_finish(move |_| state.stop_ticker());
    }
}

impl LimiterState {
    fn find(&self, request: &Request) -> Option<&CompiledRule> {
        let host = request.host()?;
        self.rules.iter().find(|rule| rule.matches(&host))
    }

    fn admit(&self, task: &Task) -> bool {
        let Some(rule) = self.find(&task.request) else {
            if self.whitelist {
                trace!("{} matches no rule, rejected by whitelist", task.request);
            }
            return !self.whitelist;
        };

        if rule.policy == Policy::Deny {
            trace!("{} denied by rule {}", task.request, rule.pattern);
            return false;
        }
        if let (Some(max), Some(depth)) = (rule.max_depth, task.request.get_depth()) {
            if depth > max {
                trace!("{} at depth {} exceeds {} for rule {}", task.request, depth, max, rule.pattern);
                return false;
            }
        }
        if !rule.state.take_request() {
            debug!("Request quota of rule {} exhausted", rule.pattern);
            return false;
        }
        true
    }

    fn has_rate_rules(&self) -> bool {
        self.rules
            .iter()
            .any(|rule| matches!(rule.throttle, Throttle::Rate(_)))
    }

    fn refill(&self) {
        for rule in &self.rules {
            if let Throttle::Rate(cap) = rule.throttle {
                rule.state.refill(cap);
            }
        }
    }

    /// Start the once-per-second token refill if any rule needs it
    fn start_ticker(self: &Arc<Self>) {
        if !self.has_rate_rules() {
            return;
        }
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.is_some() {
            return;
        }

        let state: Weak<Self> = Arc::downgrade(self);
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                match state.upgrade() {
                    Some(state) => state.refill(),
                    None => break,
                }
            }
        }));
        debug!("Rate limiter ticker started");
    }

    fn stop_ticker(&self) {
        let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(ticker) = ticker {
            ticker.abort();
            debug!("Rate limiter ticker stopped");
        }
    }
}

impl Drop for LimiterState {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

fn jitter(bound: Duration) -> Duration {
    let nanos = bound.as_nanos().min(u64::MAX as u128) as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
}

struct LimitMiddleware(Arc<LimiterState>);

#[async_trait]
impl Middleware for LimitMiddleware {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response, CrawlError> {
        let Some(rule) = self.0.find(&request) else {
            return next.run(request).await;
        };

        match &rule.throttle {
            Throttle::Delay { delay, jitter: bound } => {
                let mut last = rule.state.last_dispatch.lock().await;
                if let Some(at) = *last {
                    let since = at.elapsed();
                    if since < *delay {
                        tokio::time::sleep(*delay - since).await;
                    }
                }
                let extra = jitter(*bound);
                if !extra.is_zero() {
                    tokio::time::sleep(extra).await;
                }
                *last = Some(Instant::now());
                drop(last);

                next.run(request).await
            }
            Throttle::Rate(_) => {
                self.0.start_ticker();
                rule.state.take_token().await;
                next.run(request).await
            }
            Throttle::Parallel(slots) => {
                let _permit = slots.acquire().await.ok();
                next.run(request).await
            }
            Throttle::Unthrottled => next.run(request).await,
        }
    }
}
