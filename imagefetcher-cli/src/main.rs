//! imagefetcher CLI - fetch and resize images from the shell
//!
//! Every URL is fetched concurrently through one controller, so duplicate
//! URLs coalesce and `--repeat` shows memory cache hits.

mod error;
mod runner;

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use imagefetcher::decode::ImageCrateDecoder;
use imagefetcher::transport::Transport;
use imagefetcher::{FetchResult, ImageFetchController, Priority, Request, Size, SizeMetrics};

use error::CliError;
use runner::CliRunner;

#[derive(Parser)]
#[command(name = "imagefetcher")]
#[command(version = imagefetcher::VERSION)]
#[command(about = "Fetch, decode and resize images with request coalescing", long_about = None)]
struct Args {
    /// Image URLs to fetch
    #[arg(required = true)]
    urls: Vec<String>,

    /// Logical target width (omit width and height for original size)
    #[arg(long, requires = "height")]
    width: Option<f64>,

    /// Logical target height
    #[arg(long, requires = "width")]
    height: Option<f64>,

    /// Device pixel scale applied to the target size
    #[arg(long, default_value = "1.0")]
    scale: f64,

    /// Declared source width
    #[arg(long, default_value = "4096")]
    source_width: f64,

    /// Declared source height
    #[arg(long, default_value = "4096")]
    source_height: f64,

    /// Submit requests as low priority
    #[arg(long)]
    low_priority: bool,

    /// Fetch the whole list this many times
    #[arg(long, default_value = "1")]
    repeat: u32,

    /// Write each decoded image as PNG into this directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Config file (default: the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fetch over HTTP only, bypassing the disk cache
    #[arg(long)]
    no_disk_cache: bool,

    /// Print debug logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        e.exit();
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    if args.repeat == 0 {
        return Err(CliError::InvalidArgs("--repeat must be at least 1".to_string()));
    }

    let runner = CliRunner::new(args.config.as_deref(), args.verbose)?;

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir).map_err(|error| CliError::OutputDir {
            path: dir.clone(),
            error,
        })?;
    }

    let requests = build_requests(&args)?;
    let config = runner.config();

    if config.disk_cache_enabled && !args.no_disk_cache {
        let transport = runner.disk_cached_transport().await?;
        let controller = ImageFetchController::new(
            config.fetcher.clone(),
            transport,
            ImageCrateDecoder::default(),
        )?;
        let outcome = fetch_all(&controller, &requests, &args).await;
        let disk = controller.transport().stats();
        println!(
            "Disk cache: {} hits, {} misses, {} write failures",
            disk.hits, disk.misses, disk.write_failures
        );
        outcome
    } else {
        let transport = runner.http_transport()?;
        let controller = ImageFetchController::new(
            config.fetcher.clone(),
            transport,
            ImageCrateDecoder::default(),
        )?;
        fetch_all(&controller, &requests, &args).await
    }
}

fn build_requests(args: &Args) -> Result<Vec<Request>, CliError> {
    let size_metrics = match (args.width, args.height) {
        (Some(width), Some(height)) => {
            let metrics = SizeMetrics::for_frame(
                Size::new(width, height),
                args.scale,
                Size::new(args.source_width, args.source_height),
            );
            if metrics.is_none() {
                return Err(CliError::InvalidArgs(
                    "target size, scale and source size must all be positive".to_string(),
                ));
            }
            metrics
        }
        _ => None,
    };

    let priority = if args.low_priority {
        Priority::Low
    } else {
        Priority::Normal
    };

    Ok(args
        .urls
        .iter()
        .enumerate()
        .map(|(index, url)| {
            Request::new(url.as_str(), format!("arg-{index}"))
                .with_priority(priority)
                .with_size_metrics(size_metrics)
        })
        .collect())
}

async fn fetch_all<T: Transport>(
    controller: &ImageFetchController<T, ImageCrateDecoder>,
    requests: &[Request],
    args: &Args,
) -> Result<(), CliError> {
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding fetches");
            signal_token.cancel();
        }
    });

    let mut failed = 0;
    let mut total = 0;

    for round in 1..=args.repeat {
        if args.repeat > 1 {
            println!("Round {}/{}", round, args.repeat);
        }

        let started = Instant::now();
        let results = join_all(
            requests
                .iter()
                .map(|request| controller.fetch_with_cancellation(request.clone(), &shutdown)),
        )
        .await;
        info!(
            round,
            requests = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Round complete"
        );

        for result in &results {
            total += 1;
            if !print_result(result) {
                failed += 1;
                continue;
            }
            if let (Some(dir), Some(image)) = (&args.output_dir, result.image()) {
                let path = output_path(dir, result.request());
                image.image().save(&path).map_err(|error| CliError::ImageWrite {
                    path: path.clone(),
                    error,
                })?;
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
    }

    print_stats(controller);

    if failed > 0 {
        Err(CliError::FetchFailed { failed, total })
    } else {
        Ok(())
    }
}

/// Print one line for `result`. Returns true on success.
fn print_result(result: &FetchResult) -> bool {
    let url = result.request().url();
    match result {
        FetchResult::Success { image, metrics, .. } => {
            println!(
                "  {:<12} {:>11} {:>8.1}ms{} {}",
                metrics.fulfillment_type.to_string(),
                image.dimensions().to_string(),
                metrics.elapsed.as_secs_f64() * 1000.0,
                if metrics.coalesced { " (coalesced)" } else { "" },
                url
            );
            true
        }
        FetchResult::Error { error, .. } => {
            println!("  {:<12} {} ({})", "error", url, error);
            false
        }
    }
}

fn print_stats<T: Transport>(controller: &ImageFetchController<T, ImageCrateDecoder>) {
    let stats = controller.stats();
    controller.log_stats();

    println!();
    println!("Requests:      {}", stats.requests);
    println!("Memory hits:   {}", stats.memory_hits);
    println!("Downloads:     {}", stats.downloads);
    println!("Disk hits:     {}", stats.disk_hits);
    println!("Failures:      {}", stats.failures);
    println!("Coalesced:     {}", stats.registry.joins);
    println!("Peak parallel: {}", stats.peak_downloads);
    println!(
        "Memory cache:  {} entries, {} of {}",
        stats.memory_cache.entry_count,
        imagefetcher::config::format_size(stats.memory_cache.weighted_size as usize),
        imagefetcher::config::format_size(stats.memory_cache.capacity_bytes as usize),
    );
}

/// `<dir>/<index>-<last path segment>.png`
fn output_path(dir: &Path, request: &Request) -> PathBuf {
    let stem: String = request
        .url()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("image")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{}-{}.png", request.identifier(), stem))
}
