//! Exposes the command line application.
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use callguard_service::clock::SystemClock;
use callguard_service::config::Config;
use callguard_service::invoker::HttpInvoker;
use callguard_service::{CallAdapter, CallError, Endpoint, ResponseSource, metrics};
use clap::{Parser, Subcommand};
use console::style;
use futures::future::join_all;

use crate::logging;

/// Callguard commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Call a declared endpoint and print the response body.
    Fetch {
        /// The name of the endpoint in the configuration file.
        endpoint: String,

        /// Query parameters to append, as `key=value`.
        #[arg(long, short, value_name = "KEY=VALUE", value_parser = parse_query_pair)]
        query: Vec<(String, String)>,

        /// Number of concurrent callers.
        ///
        /// All callers share a single network call.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        burst: u32,
    },

    /// Drop the cached response of a declared endpoint.
    Invalidate {
        /// The name of the endpoint in the configuration file.
        endpoint: String,
    },

    /// Clean up stale entries of the disk cache.
    Cleanup {
        /// Only report what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn parse_query_pair(pair: &str) -> Result<(String, String), String> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| format!("expected `key=value`, got `{pair}`"))?;
    if key.is_empty() {
        return Err(format!("missing key in `{pair}`"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: We are still single-threaded, the runtime is started below.
    unsafe { logging::init_logging(&config) };
    metrics::configure(&config.metrics).context("failed to configure metrics")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("callguard")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async {
        match cli.command {
            Command::Fetch {
                endpoint,
                query,
                burst,
            } => {
                let endpoint = config.endpoint(&endpoint)?.with_query(query);
                fetch(&config, &endpoint, burst).await
            }
            Command::Invalidate { endpoint } => {
                let endpoint = config.endpoint(&endpoint)?;
                adapter(&config)?.invalidate(&endpoint);
                Ok(())
            }
            Command::Cleanup { dry_run } => cleanup(&config, dry_run),
        }
    })
}

fn adapter(config: &Config) -> Result<CallAdapter> {
    let invoker =
        HttpInvoker::from_timeouts(config.timeouts).context("failed to create HTTP client")?;
    CallAdapter::from_config(config, Arc::new(invoker), Arc::new(SystemClock::default()))
        .context("failed to open the cache")
}

async fn fetch(config: &Config, endpoint: &Endpoint, burst: u32) -> Result<()> {
    let adapter = adapter(config)?;
    let results = join_all((0..burst).map(|_| adapter.call(endpoint))).await;

    let mut sources = BTreeMap::<&str, usize>::new();
    let mut body = None;
    let mut failure: Option<CallError> = None;
    for result in results {
        match result {
            Ok(response) => {
                *sources.entry(response.source.as_str()).or_default() += 1;
                if body.is_none() || response.source == ResponseSource::Network {
                    body = Some(response.body);
                }
            }
            Err(error) => {
                *sources.entry(error.kind().as_str()).or_default() += 1;
                failure = Some(error);
            }
        }
    }

    let summary = sources
        .iter()
        .map(|(source, count)| format!("{source}: {count}"))
        .collect::<Vec<_>>()
        .join(", ");
    eprintln!("{} {}", style(&endpoint.name).bold(), style(summary).dim());

    match (body, failure) {
        (Some(body), _) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&body)?;
            stdout.flush()?;
            Ok(())
        }
        (None, Some(error)) => Err(error).context(format!("calling `{}` failed", endpoint.name)),
        (None, None) => Ok(()),
    }
}

fn cleanup(config: &Config, dry_run: bool) -> Result<()> {
    let adapter = adapter(config)?;
    let stats = adapter
        .store()
        .cleanup(dry_run)
        .context("failed to clean up caches")?;

    let verb = if dry_run { "would remove" } else { "removed" };
    eprintln!(
        "{} {verb} {} files ({} bytes), retained {} files ({} bytes)",
        style("cleanup").bold(),
        stats.removed_files,
        stats.removed_bytes,
        stats.retained_files,
        stats.retained_bytes,
    );
    Ok(())
}
