use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::crawler::{Engine, Extension, Flow};
use crate::error::CrawlError;

/// When a new proxy is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    /// Every request gets a fresh pick
    Request,
    /// Keep one proxy for the given interval
    Timed(Duration),
    /// Keep one proxy for the whole run, unless it fails
    Session,
}

/// Individual proxy configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    pub name: String,
    /// "http" or "socks5"
    pub proxy_type: String,
    pub address: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Build the proxy URL understood by the downloader
    pub fn url(&self) -> Result<String, CrawlError> {
        let (scheme, default_port) = match self.proxy_type.as_str() {
            "http" => ("http", 8080),
            "socks5" => ("socks5", 1080),
            other => {
                return Err(CrawlError::Config(format!("unsupported proxy type: {}", other)));
            }
        };
        let port = self.port.unwrap_or(default_port);

        Ok(match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                format!("{}://{}:{}@{}:{}", scheme, username, password, self.address, port)
            }
            _ => format!("{}://{}:{}", scheme, self.address, port),
        })
    }
}

struct RotationState {
    current: Option<String>,
    last_rotation: Instant,
    failed: HashSet<String>,
}

/// Assigns proxies to outgoing requests
///
/// Requests that already carry a proxy chosen by the caller are left alone.
/// A proxy whose request fails at the transport level is benched until
/// every proxy has failed, at which point all are tried again.
#[derive(Clone)]
pub struct ProxyRotation {
    proxies: Arc<Vec<String>>,
    strategy: RotationStrategy,
    state: Arc<Mutex<RotationState>>,
}

impl ProxyRotation {
    pub fn new(strategy: RotationStrategy, proxies: Vec<String>) -> Result<Self, CrawlError> {
        if proxies.is_empty() {
            return Err(CrawlError::Config("No proxies configured".to_string()));
        }
        Ok(Self {
            proxies: Arc::new(proxies),
            strategy,
            state: Arc::new(Mutex::new(RotationState {
                current: None,
                last_rotation: Instant::now(),
                failed: HashSet::new(),
            })),
        })
    }

    pub fn from_configs(strategy: RotationStrategy, configs: &[ProxyConfig]) -> Result<Self, CrawlError> {
        let proxies = configs.iter().map(ProxyConfig::url).collect::<Result<Vec<_>, _>>()?;
        Self::new(strategy, proxies)
    }

    /// Get a proxy for the next request
    pub fn next_proxy(&self) -> String {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let should_rotate = match self.strategy {
            RotationStrategy::Request => true,
            RotationStrategy::Timed(interval) => state.last_rotation.elapsed() >= interval,
            RotationStrategy::Session => false,
        };

        match &state.current {
            Some(current) if !should_rotate && !state.failed.contains(current) => current.clone(),
            _ => self.rotate(&mut state),
        }
    }

    fn rotate(&self, state: &mut RotationState) -> String {
        let mut working: Vec<&String> = self
            .proxies
            .iter()
            .filter(|p| !state.failed.contains(*p))
            .collect();

        if working.is_empty() {
            debug!("No working proxies found, resetting status");
            state.failed.clear();
            working = self.proxies.iter().collect();
        }

        let proxy = working[thread_rng().gen_range(0..working.len())].clone();
        debug!("Rotated to proxy: {}", proxy);

        state.current = Some(proxy.clone());
        state.last_rotation = Instant::now();
        proxy
    }

    /// Bench a proxy after a failed exchange
    pub fn mark_failed(&self, proxy: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.failed.insert(proxy.to_string()) {
            warn!("Marking proxy as failed: {}", proxy);
        }
    }
}

impl Extension for ProxyRotation {
    fn install(self, engine: &mut Engine) {
        let rotation = self.clone();
        engine.on_req(move |_, mut request| {
            if request.get_proxy().is_none() || request.meta().random_proxy {
                request.set_proxy(Some(rotation.next_proxy()));
                request.meta_mut().random_proxy = true;
            }
            Flow::Continue(request)
        });

        engine.on_error(move |ctx, err| {
            let Some(failure) = err.as_downloader() else {
                return;
            };
            if failure.response.is_some() || !failure.request.meta().random_proxy {
                return;
            }
            if let Some(proxy) = failure.request.get_proxy() {
                self.mark_failed(proxy);
                debug!("Task {} failed through proxy {}", ctx.id(), proxy);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxies() -> Vec<String> {
        vec!["http://p1:8080".to_string(), "http://p2:8080".to_string()]
    }

    #[test]
    fn test_session_keeps_proxy_until_it_fails() {
        let rotation = ProxyRotation::new(RotationStrategy::Session, proxies()).unwrap();
        let first = rotation.next_proxy();
        for _ in 0..10 {
            assert_eq!(rotation.next_proxy(), first);
        }

        rotation.mark_failed(&first);
        let second = rotation.next_proxy();
        assert_ne!(second, first);

        // Once every proxy failed, all are tried again
        rotation.mark_failed(&second);
        assert!(proxies().contains(&rotation.next_proxy()));
    }

    #[tokio::test]
    async fn test_timed_rotation() {
        let rotation = ProxyRotation::new(
            RotationStrategy::Timed(Duration::from_millis(30)),
            vec!["http://only:8080".to_string()],
        )
        .unwrap();
        let before = rotation.state.lock().unwrap().last_rotation;
        rotation.next_proxy();
        tokio::time::sleep(Duration::from_millis(40)).await;
        rotation.next_proxy();
        assert!(rotation.state.lock().unwrap().last_rotation > before);
    }

    #[test]
    fn test_proxy_config_url() {
        let mut config = ProxyConfig {
            name: "tor".to_string(),
            proxy_type: "socks5".to_string(),
            address: "127.0.0.1".to_string(),
            port: Some(9050),
            username: None,
            password: None,
        };
        assert_eq!(config.url().unwrap(), "socks5://127.0.0.1:9050");

        config.proxy_type = "http".to_string();
        config.port = None;
        config.username = Some("u".to_string());
        config.password = Some("p".to_string());
        assert_eq!(config.url().unwrap(), "http://u:p@127.0.0.1:8080");

        config.proxy_type = "vpn".to_string();
        assert!(config.url().is_err());
        assert!(ProxyRotation::new(RotationStrategy::Request, vec![]).is_err());
    }
}
