use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::redirect::Policy;
use reqwest::{Client, ClientBuilder};
use tracing::{debug, trace};
use url::Url;

use super::{Request, Response};
use crate::error::{CrawlError, TransportError};

/// Executes one request and returns its response
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, request: Request) -> Result<Response, CrawlError>;

    /// Append a middleware. The first one added wraps all the others.
    fn add_middleware(&mut self, middleware: Arc<dyn Middleware>);
}

/// A step wrapped around the network exchange
///
/// A middleware may change the request, skip `next` entirely to answer on
/// its own, or post-process whatever `next` returns.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: Request, next: Next<'_>) -> Result<Response, CrawlError>;
}

/// The innermost step of a middleware chain
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, request: Request) -> Result<Response, CrawlError>;
}

/// The rest of a middleware chain
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    exchange: &'a dyn Exchange,
}

impl<'a> Next<'a> {
    pub fn new(middlewares: &'a [Arc<dyn Middleware>], exchange: &'a dyn Exchange) -> Self {
        Self {
            middlewares,
            exchange,
        }
    }

    pub async fn run(self, request: Request) -> Result<Response, CrawlError> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                head.handle(
                    request,
                    Next {
                        middlewares: rest,
                        exchange: self.exchange,
                    },
                )
                .await
            }
            None => self.exchange.exchange(request).await,
        }
    }
}

/// Options for the HTTP exchange
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_redirects: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_redirects: 10,
        }
    }
}

/// reqwest-backed downloader with a shared cookie jar
pub struct HttpDownloader {
    transport: Transport,
    middlewares: Vec<Arc<dyn Middleware>>,
}

struct Transport {
    client: Client,
    jar: Arc<Jar>,
    options: HttpOptions,
    /// One client per proxy URL, all sharing the same jar
    proxied: Mutex<HashMap<String, Client>>,
}

impl HttpDownloader {
    pub fn new(options: HttpOptions) -> Result<Self, CrawlError> {
        let jar = Arc::new(Jar::default());
        let client = client_builder(&jar, &options)
            .build()
            .map_err(|e| CrawlError::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            transport: Transport {
                client,
                jar,
                options,
                proxied: Mutex::new(HashMap::new()),
            },
            middlewares: Vec::new(),
        })
    }

    /// Seed the cookie jar, e.g. with a session cookie obtained out of band
    pub fn add_cookie(&self, url: &Url, cookie: &str) {
        self.transport.jar.add_cookie_str(cookie, url);
    }

    pub fn options(&self) -> &HttpOptions {
        &self.transport.options
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, request: Request) -> Result<Response, CrawlError> {
        request.check()?;
        Next::new(&self.middlewares, &self.transport).run(request).await
    }

    fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }
}

fn client_builder(jar: &Arc<Jar>, options: &HttpOptions) -> ClientBuilder {
    let mut builder = Client::builder()
        .cookie_provider(jar.clone())
        .redirect(Policy::limited(options.max_redirects));
    if let Some(agent) = &options.user_agent {
        builder = builder.user_agent(agent.clone());
    }
    builder
}

impl Transport {
    fn client_for(&self, proxy: Option<&str>) -> Result<Client, reqwest::Error> {
        let Some(proxy) = proxy else {
            return Ok(self.client.clone());
        };

        let mut proxied = self
            .proxied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = proxied.get(proxy) {
            return Ok(client.clone());
        }

        debug!("Building client for proxy {}", proxy);
        let client = client_builder(&self.jar, &self.options)
            .proxy(reqwest::Proxy::all(proxy)?)
            .build()?;
        proxied.insert(proxy.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Exchange for Transport {
    async fn exchange(&self, request: Request) -> Result<Response, CrawlError> {
        let url = request.check()?.clone();

        let client = match self.client_for(request.get_proxy()) {
            Ok(client) => client,
            Err(e) => return Err(CrawlError::downloader(request, None, e.into())),
        };

        let mut builder = client
            .request(request.method().clone(), url.clone())
            .headers(request.headers().clone())
            .timeout(self.options.timeout);
        if !request.body().is_empty() {
            builder = builder.body(request.body().to_vec());
        }

        trace!("Sending {}", request);
        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => return Err(CrawlError::downloader(request, None, e.into())),
        };

        let status = resp.status();
        let headers = resp.headers().clone();
        let final_url = resp.url().clone();

        let bytes = match resp.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                let partial = Response::new(status, headers, final_url, Vec::new(), request.meta().clone());
                return Err(CrawlError::downloader(request, Some(partial), e.into()));
            }
        };

        let body = if needs_gunzip(&headers, &url, &bytes) {
            match gunzip(&bytes) {
                Ok(body) => body,
                Err(e) => {
                    let partial = Response::new(status, headers, final_url, bytes, request.meta().clone());
                    return Err(CrawlError::downloader(request, Some(partial), e.into()));
                }
            }
        } else {
            bytes
        };

        debug!("{} -> {} ({} bytes)", request, status, body.len());
        Ok(Response::new(status, headers, final_url, body, request.meta().clone()))
    }
}

/// Gzip payloads that reqwest did not already decode: a gzip Content-Type
/// or a `.gz` path, with the gzip magic present
fn needs_gunzip(headers: &HeaderMap, url: &Url, body: &[u8]) -> bool {
    if !body.starts_with(&[0x1f, 0x8b]) {
        return false;
    }

    let header = |name| {
        headers
            .get(name)
            .and_then(|v: &reqwest::header::HeaderValue| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default()
    };
    let encoding = header(CONTENT_ENCODING);
    let content_type = header(CONTENT_TYPE);

    encoding.contains("gzip")
        || (encoding.is_empty() && content_type.contains("gzip"))
        || url.path().to_ascii_lowercase().ends_with(".gz")
}

fn gunzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(body).read_to_end(&mut out)?;
    Ok(out)
}
