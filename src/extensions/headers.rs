use rand::seq::SliceRandom;
use reqwest::header::{REFERER, USER_AGENT};

use crate::crawler::{Engine, Flow};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1",
];

pub fn random_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Sets `Referer` on follow-up tasks to the final URL of the task that
/// produced them, unless one is already set
pub fn referer_filler() -> impl FnOnce(&mut Engine) {
    |engine: &mut Engine| {
        engine.on_add(|parent, mut task| {
            let Some(parent) = parent else {
                return Flow::Continue(task);
            };
            if task.request.headers().contains_key(REFERER) {
                return Flow::Continue(task);
            }
            let referer = parent
                .response()
                .map(|r| r.url().to_string())
                .or_else(|| parent.request().url().map(|u| u.to_string()));
            if let Some(referer) = referer {
                // URLs are always valid header values
                task.request.set_header(REFERER.as_str(), &referer).ok();
            }
            Flow::Continue(task)
        });
    }
}

/// Gives requests without a User-Agent a random browser one
pub fn random_user_agent() -> impl FnOnce(&mut Engine) {
    |engine: &mut Engine| {
        engine.on_req(|_, mut request| {
            if !request.headers().contains_key(USER_AGENT) || request.meta().random_user_agent {
                if request.set_header(USER_AGENT.as_str(), random_agent()).is_ok() {
                    request.meta_mut().random_user_agent = true;
                }
            }
            Flow::Continue(request)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::handler;
    use crate::http::downloader::MockDownloader;
    use crate::http::{Request, Response};
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_referer_and_user_agent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut mock = MockDownloader::new();
        {
            let seen = seen.clone();
            mock.expect_download().returning(move |request| {
                let header = |name| {
                    request
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string()
                };
                seen.lock().unwrap().push((
                    request.url().unwrap().path().to_string(),
                    header(REFERER),
                    header(USER_AGENT),
                    request.meta().random_user_agent,
                ));
                let url = request.check()?.clone();
                Ok(Response::new(StatusCode::OK, HeaderMap::new(), url, Vec::new(), request.meta().clone()))
            });
        }

        let mut engine = Engine::new();
        engine
            .set_downloader(mock)
            .set_task_pool_size(1)
            .install(referer_filler())
            .install(random_user_agent());

        engine
            .add_task(
                Request::get("http://example.com/list").user_agent("custom/1.0"),
                vec![handler(|ctx| ctx.add_task(Request::get("/item/1"), vec![]))],
            )
            .unwrap();
        engine.run().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);

        let (path, referer, agent, random) = &seen[0];
        assert_eq!(path, "/list");
        assert_eq!(referer, "");
        assert_eq!(agent, "custom/1.0");
        assert!(!random);

        let (path, referer, agent, random) = &seen[1];
        assert_eq!(path, "/item/1");
        assert_eq!(referer, "http://example.com/list");
        assert!(USER_AGENTS.contains(&agent.as_str()));
        assert!(random);
    }
}
