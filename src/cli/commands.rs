use anyhow::{Context as _, Result};
use scraper::Selector;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Dispatch};
use url::Url;

use crawlhook::extensions::{log_errors, referer_filler, Deduplicate, Retry};
use crawlhook::{handler, Context, CrawlerConfig, Engine, EngineHandle, Flow, LimitRule, Request, Response};

/// Overrides the `crawl` command applies on top of the configuration
pub struct CrawlOptions {
    pub config: Option<PathBuf>,
    pub depth: Option<u32>,
    pub depth_first: bool,
    pub workers: Option<usize>,
    pub delay_ms: Option<u64>,
}

/// Crawl every page of the seed's host reachable through links
pub async fn crawl(url: String, options: CrawlOptions, dispatch: Dispatch) -> Result<()> {
    let seed = Url::parse(&url).context(format!("Invalid start URL: {}", url))?;
    let host = seed
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .context("Start URL has no host")?;

    let mut config = match &options.config {
        Some(path) => CrawlerConfig::load_from_file(path)?,
        None => CrawlerConfig::load_default()?,
    };

    if let Some(workers) = options.workers {
        config.engine.task_pool_size = Some(workers);
    }
    if options.depth_first {
        config.engine.depth_first = true;
    }
    if options.depth.is_some() || options.delay_ms.is_some() {
        // First match wins, so the command line rule goes in front
        let rule = site_rule(&host, options.depth, options.delay_ms);
        config.limiter.rules.insert(0, rule);
    }

    let mut engine = Engine::from_config(&config)?;
    engine
        .set_logger(dispatch)
        .install(Deduplicate::new())
        .install(Retry::new(2))
        .install(referer_filler())
        .install(log_errors())
        .on_item(|item| {
            println!("{}", item);
            Flow::Continue(item)
        });

    if let Some(settings) = &config.redis {
        share_queue(&mut engine, settings).await?;
    }

    let handle = engine.handle();
    engine.add_task(Request::get(seed.as_str()), vec![handler(page)])?;
    stop_on_ctrl_c(handle.clone());
    engine.run().await?;

    let stats = handle.stats();
    info!(
        "Crawled {} pages with {} errors in {:.1}s",
        stats.responses, stats.errors, stats.elapsed_secs
    );
    Ok(())
}

/// A rule matching exactly the seed's host, whatever characters it holds
fn site_rule(host: &str, depth: Option<u32>, delay_ms: Option<u64>) -> LimitRule {
    let mut rule = LimitRule::regex(&format!("^{}$", regex::escape(host)));
    if let Some(depth) = depth {
        rule = rule.max_depth(depth);
    }
    if let Some(delay) = delay_ms {
        rule = rule.delay(Duration::from_millis(delay));
    }
    rule
}

/// Pull tasks from the configured Redis queue and push items back to it.
/// The crawl then runs until interrupted.
#[cfg(feature = "distributed")]
async fn share_queue(engine: &mut Engine, settings: &crawlhook::config::QueueSettings) -> Result<()> {
    use crawlhook::extensions::distributed;
    use crawlhook::storage::RedisScheduler;
    use std::sync::Arc;

    let scheduler = RedisScheduler::connect(settings.clone(), vec![handler(page)])
        .await
        .context(format!("Failed to connect to {}", settings.redis_url))?;
    info!("Sharing queue {} on {}", settings.name, settings.redis_url);
    engine.install(distributed(Arc::new(scheduler)));
    Ok(())
}

#[cfg(not(feature = "distributed"))]
async fn share_queue(_: &mut Engine, _: &crawlhook::config::QueueSettings) -> Result<()> {
    anyhow::bail!("The redis section needs a build with the `distributed` feature")
}

fn stop_on_ctrl_c(handle: EngineHandle) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, stopping the crawl");
                handle.stop();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });
}

/// Seed a shared Redis queue and print the items crawl workers push back
#[cfg(feature = "distributed")]
pub async fn manager(config: Option<PathBuf>, seeds: Vec<String>) -> Result<()> {
    use crawlhook::storage::ItemManager;
    use std::sync::Arc;

    let config = match &config {
        Some(path) => CrawlerConfig::load_from_file(path)?,
        None => CrawlerConfig::load_default()?,
    };
    let settings = config
        .redis
        .context("The configuration has no redis section")?;

    let mut manager = ItemManager::connect(settings.clone())
        .await
        .context(format!("Failed to connect to {}", settings.redis_url))?;
    if let Some(size) = config.engine.item_pool_size {
        manager.set_item_pool_size(size);
    }
    manager.on_item(|item| {
        println!("{}", item);
        Flow::Continue(item)
    });

    let manager = Arc::new(manager);
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping the item manager");
                manager.stop();
            }
        });
    }

    let run = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };
    for seed in &seeds {
        manager.send_request(&Request::get(seed)).await?;
        info!("Queued {}", seed);
    }

    run.await.context("Item manager task failed")??;
    Ok(())
}

#[cfg(not(feature = "distributed"))]
pub async fn manager(_: Option<PathBuf>, _: Vec<String>) -> Result<()> {
    anyhow::bail!("The manager command needs a build with the `distributed` feature")
}

/// Emit a summary item for the page and follow its same-host links
fn page(ctx: &mut Context) {
    let Some(response) = ctx.response() else {
        return;
    };
    let depth = ctx.request().get_depth().unwrap_or(1);
    let item = summarize(response, depth);
    let links = same_host_links(response);

    ctx.add_item(item);
    for link in links {
        ctx.add_task(Request::get(link.as_str()), vec![handler(page)]);
    }
}

fn summarize(response: &Response, depth: u32) -> Value {
    let title = if response.is_html() {
        Selector::parse("title").ok().and_then(|selector| {
            response
                .html()
                .select(&selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
        })
    } else {
        None
    };

    json!({
        "url": response.url().as_str(),
        "status": response.status().as_u16(),
        "title": title,
        "depth": depth,
    })
}

/// Absolute http(s) links pointing at the response's own host
fn same_host_links(response: &Response) -> Vec<Url> {
    if !response.is_html() {
        return Vec::new();
    }
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let base = response.url();
    let host = base.host_str().map(|h| h.to_ascii_lowercase());

    response
        .html()
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .filter(|url| url.host_str().map(|h| h.to_ascii_lowercase()) == host)
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .collect()
}

pub fn config_path() -> Result<()> {
    println!("{}", CrawlerConfig::default_path().display());
    Ok(())
}

pub fn init_config() -> Result<()> {
    CrawlerConfig::default().save_as_default()?;
    println!("Wrote default configuration to {}", CrawlerConfig::default_path().display());
    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("# {}", CrawlerConfig::default_path().display());
    print!(
        "{}",
        serde_yaml::to_string(&config).context("Failed to serialize configuration")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlhook::{Limiter, Meta, Task};
    use reqwest::header::{HeaderMap, CONTENT_TYPE};
    use reqwest::StatusCode;

    fn html_response(url: &str, body: &str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "text/html; charset=utf-8".parse().unwrap());
        Response::new(
            StatusCode::OK,
            headers,
            Url::parse(url).unwrap(),
            body.as_bytes().to_vec(),
            Meta::default(),
        )
    }

    #[test]
    fn test_summarize_page() {
        let response = html_response(
            "https://example.com/docs/",
            "<html><head><title> Docs </title></head><body></body></html>",
        );
        assert_eq!(
            summarize(&response, 2),
            json!({"url": "https://example.com/docs/", "status": 200, "title": "Docs", "depth": 2})
        );
    }

    #[test]
    fn test_only_same_host_links_are_followed() {
        let response = html_response(
            "https://Example.com/docs/",
            r##"
            <a href="intro.html#top">intro</a>
            <a href="/about">about</a>
            <a href="https://EXAMPLE.com/blog">blog</a>
            <a href="https://other.org/">other</a>
            <a href="mailto:me@example.com">mail</a>
            <a>no href</a>
            "##,
        );

        let links: Vec<String> = same_host_links(&response).iter().map(|u| u.to_string()).collect();
        assert_eq!(
            links,
            vec![
                "https://example.com/docs/intro.html",
                "https://example.com/about",
                "https://example.com/blog",
            ]
        );
    }

    #[test]
    fn test_site_rule_matches_only_the_literal_host() {
        let limiter = Limiter::new(true, vec![site_rule("[::1]", Some(2), None)]).unwrap();
        let task = |url: &str, depth| Task::new(Request::get(url).depth(depth), vec![]);

        assert!(limiter.admit(&task("http://[::1]:8080/", 1)));
        assert!(!limiter.admit(&task("http://[::1]:8080/deep", 3)));

        let limiter = Limiter::new(true, vec![site_rule("a.example.com", None, Some(10))]).unwrap();
        assert!(limiter.admit(&task("http://a.example.com/", 1)));
        assert!(!limiter.admit(&task("http://aXexample.com/", 1)));
    }
}
