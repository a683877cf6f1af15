use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::crawler::{Context, Engine, Extension};
use crate::http::Request;

/// Re-submits failed requests with the handlers of the failed task
///
/// Transport failures are always retried. With `ok_codes` set, responses
/// with any other status are retried too and their task is aborted before
/// the handlers run. Once `max_times` is reached the failure stands.
#[derive(Debug, Clone)]
pub struct Retry {
    pub max_times: u32,
    pub ok_codes: Vec<StatusCode>,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_times: 3,
            ok_codes: Vec::new(),
        }
    }
}

impl Retry {
    pub fn new(max_times: u32) -> Self {
        Self {
            max_times,
            ..Self::default()
        }
    }

    pub fn ok_codes(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.ok_codes = codes.into_iter().collect();
        self
    }

    /// Queue another attempt, false once the request is out of attempts
    fn resubmit(&self, ctx: &mut Context, mut request: Request) -> bool {
        let attempts = request.meta().retry_times;
        if attempts >= self.max_times {
            warn!("Giving up on {} after {} retries", request, attempts);
            return false;
        }
        request.meta_mut().retry_times = attempts + 1;
        debug!("Retrying {} ({}/{})", request, attempts + 1, self.max_times);

        let handlers = ctx.handlers().to_vec();
        ctx.add_task(request, handlers);
        true
    }
}

impl Extension for Retry {
    fn install(self, engine: &mut Engine) {
        let retry = Arc::new(self);

        let on_error = retry.clone();
        engine.on_error(move |ctx, err| {
            if let Some(failure) = err.as_downloader() {
                on_error.resubmit(ctx, failure.request.clone());
            }
        });

        if !retry.ok_codes.is_empty() {
            engine.on_resp(move |ctx| {
                let Some(status) = ctx.response().map(|r| r.status()) else {
                    return;
                };
                if retry.ok_codes.contains(&status) {
                    return;
                }
                let request = ctx.request().clone();
                if retry.resubmit(ctx, request) {
                    ctx.abort();
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::handler;
    use crate::error::{CrawlError, TransportError};
    use crate::http::downloader::MockDownloader;
    use crate::http::Response;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_transport_failures_are_retried_up_to_the_limit() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut mock = MockDownloader::new();
        {
            let attempts = attempts.clone();
            mock.expect_download().returning(move |request| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CrawlError::downloader(
                    request,
                    None,
                    TransportError::Middleware("connection reset".to_string()),
                ))
            });
        }

        let retries = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        engine.set_downloader(mock).install(Retry::new(2));
        {
            let retries = retries.clone();
            engine.on_error(move |ctx, _| retries.lock().unwrap().push(ctx.request().meta().retry_times));
        }

        engine.add_task(Request::get("http://example.com/"), vec![]).unwrap();
        engine.run().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*retries.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_unexpected_status_is_retried_with_same_handlers() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut mock = MockDownloader::new();
        {
            let attempts = attempts.clone();
            mock.expect_download().returning(move |request| {
                let status = if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::OK
                };
                let url = request.check()?.clone();
                Ok(Response::new(status, HeaderMap::new(), url, Vec::new(), request.meta().clone()))
            });
        }

        let handled = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        engine
            .set_downloader(mock)
            .install(Retry::new(3).ok_codes([StatusCode::OK]));

        let record = {
            let handled = handled.clone();
            handler(move |ctx| {
                let status = ctx.response().map(|r| r.status().as_u16()).unwrap_or(0);
                handled.lock().unwrap().push(status);
            })
        };
        engine.add_task(Request::get("http://example.com/"), vec![record]).unwrap();
        engine.run().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(*handled.lock().unwrap(), vec![200]);
    }
}
