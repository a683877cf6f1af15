pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Dispatch};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file, the default log location when no path is given
    #[arg(long, global = true, num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the pages of one site, printing one JSON line per page
    Crawl {
        /// Target URL to start crawling from
        #[arg(required = true)]
        url: String,

        /// Configuration file to use instead of the default one
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum crawling depth, the seed page being depth 1
        #[arg(short, long)]
        depth: Option<u32>,

        /// Follow the newest link first
        #[arg(long)]
        depth_first: bool,

        /// Number of pages fetched concurrently
        #[arg(short, long)]
        workers: Option<usize>,

        /// Minimum delay between two requests to the site, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Seed the shared Redis queue and print the items workers send back
    Manager {
        /// Configuration file to use instead of the default one
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// URLs to queue before consuming items
        seeds: Vec<String>,
    },

    /// Show or initialize the default configuration
    Config {
        /// Write the built-in defaults to the default configuration file
        #[arg(long)]
        init: bool,

        /// Only print where the default configuration lives
        #[arg(long)]
        path: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli, dispatch: Dispatch) -> Result<()> {
    match cli.command {
        Commands::Crawl {
            url,
            config,
            depth,
            depth_first,
            workers,
            delay_ms,
        } => {
            info!("Starting crawl on {}", url);
            let options = commands::CrawlOptions {
                config,
                depth,
                depth_first,
                workers,
                delay_ms,
            };
            commands::crawl(url, options, dispatch).await
        }
        Commands::Manager { config, seeds } => {
            info!("Starting item manager with {} seeds", seeds.len());
            commands::manager(config, seeds).await
        }
        Commands::Config { init, path } => {
            if path {
                commands::config_path()
            } else if init {
                info!("Writing default configuration");
                commands::init_config()
            } else {
                commands::show_config()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_crawl_arguments() {
        let cli = Cli::try_parse_from([
            "crawlhook",
            "crawl",
            "https://example.com",
            "--depth",
            "2",
            "--workers",
            "4",
            "--verbose",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Crawl { url, depth, workers, depth_first, .. } => {
                assert_eq!(url, "https://example.com");
                assert_eq!(depth, Some(2));
                assert_eq!(workers, Some(4));
                assert!(!depth_first);
            }
            _ => panic!("expected crawl"),
        }
    }

    #[test]
    fn test_manager_arguments() {
        let cli = Cli::try_parse_from([
            "crawlhook",
            "manager",
            "https://a.com/",
            "https://b.com/",
            "--config",
            "shared.yaml",
            "--log-file",
        ])
        .unwrap();

        assert_eq!(cli.log_file, Some(None));
        match cli.command {
            Commands::Manager { config, seeds } => {
                assert_eq!(config, Some(PathBuf::from("shared.yaml")));
                assert_eq!(seeds, vec!["https://a.com/", "https://b.com/"]);
            }
            _ => panic!("expected manager"),
        }
    }
}
