use thiserror::Error;

use crate::http::{Request, Response};

/// Errors surfaced by the crawl engine and its collaborators
#[derive(Error, Debug)]
pub enum CrawlError {
    /// The request was malformed before it was ever dispatched
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),

    /// The exchange failed after dispatch
    #[error(transparent)]
    Downloader(#[from] Box<DownloaderError>),

    /// A hook or handler panicked while a task was executing
    #[error("task panicked: {0}")]
    Panic(String),

    /// Work was submitted after the engine shut its pools down
    #[error("{0} pool is closed")]
    PoolClosed(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("queue backend error: {0}")]
    Queue(String),
}

impl CrawlError {
    pub fn downloader(request: Request, response: Option<Response>, source: TransportError) -> Self {
        CrawlError::Downloader(Box::new(DownloaderError {
            request,
            response,
            source,
        }))
    }

    /// The wrapped downloader failure, if this is one
    pub fn as_downloader(&self) -> Option<&DownloaderError> {
        match self {
            CrawlError::Downloader(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            CrawlError::Downloader(err) => err.is_timeout(),
            _ => false,
        }
    }
}

/// Construction errors recorded on a request before dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("malformed url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header {0:?}")]
    InvalidHeader(String),

    #[error("unserializable body: {0}")]
    Body(String),

    #[error("relative url {0:?} was never resolved against a parent response")]
    Unresolved(String),
}

/// A failed exchange, carrying the originating request and any partial response
#[derive(Error, Debug)]
#[error("download of {} failed: {source}", .request.describe())]
pub struct DownloaderError {
    pub request: Request,
    pub response: Option<Response>,
    #[source]
    pub source: TransportError,
}

impl DownloaderError {
    pub fn is_timeout(&self) -> bool {
        matches!(&self.source, TransportError::Http(e) if e.is_timeout())
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("http exchange: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decoding body: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Middleware(String),
}
