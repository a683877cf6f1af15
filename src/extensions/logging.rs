use std::time::Duration;

use tracing::instrument::WithSubscriber;
use tracing::{error, info};

use crate::crawler::Engine;

/// Log every failed task with its request and any partial response
pub fn log_errors() -> impl FnOnce(&mut Engine) {
    |engine: &mut Engine| {
        engine.on_error(|ctx, err| {
            let status = ctx
                .response()
                .map(|r| r.status().to_string())
                .unwrap_or_else(|| "no response".to_string());
            error!(
                task = %ctx.id(),
                depth = ?ctx.request().get_depth(),
                retries = ctx.request().meta().retry_times,
                timeout = err.is_timeout(),
                "{} failed ({}): {}",
                ctx.request(),
                status,
                err
            );
        });
    }
}

/// Log throughput every `interval` while the engine runs
pub fn progress(interval: Duration) -> impl FnOnce(&mut Engine) {
    move |engine: &mut Engine| {
        engine.on_start(move |handle| {
            let handle = handle.clone();
            tokio::spawn(
                async move {
                    let mut last = handle.stats();
                    loop {
                        tokio::time::sleep(interval).await;
                        if handle.is_finished() {
                            break;
                        }
                        let now = handle.stats();
                        let secs = interval.as_secs_f64().max(f64::EPSILON);
                        info!(
                            "Progress: {} tasks ({:.1}/s), {} items ({:.1}/s), {} errors, {} running",
                            now.requests,
                            now.requests.saturating_sub(last.requests) as f64 / secs,
                            now.items_processed,
                            now.items_processed.saturating_sub(last.items_processed) as f64 / secs,
                            now.errors,
                            handle.running_tasks()
                        );
                        last = now;
                    }
                }
                .with_current_subscriber(),
            );
        });
    }
}
