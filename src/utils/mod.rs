pub mod logging;
pub mod metrics;

pub use logging::{build_dispatch, default_log_file};
pub use metrics::{CrawlStats, StatsSnapshot};
