//! Optional behaviour packaged as engine extensions
//!
//! Each extension only registers hooks or middleware through the public
//! engine API; none of them is installed by default.

pub mod dedup;
pub mod headers;
pub mod logging;
pub mod proxy;
pub mod retry;

use std::sync::Arc;

use crate::crawler::{Engine, Scheduler};

pub use dedup::Deduplicate;
pub use headers::{random_user_agent, referer_filler};
pub use logging::{log_errors, progress};
pub use proxy::{ProxyConfig, ProxyRotation, RotationStrategy};
pub use retry::Retry;

/// Run against a shared scheduler. The engine keeps waiting for work
/// instead of stopping when its queue drains.
pub fn distributed(scheduler: Arc<dyn Scheduler>) -> impl FnOnce(&mut Engine) {
    move |engine: &mut Engine| {
        engine.set_scheduler(scheduler).set_auto_stop(false);
    }
}
