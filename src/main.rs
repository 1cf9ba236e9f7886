// lecture-dl: download the lecture recordings listed in a file of source page URLs.
//
// Run with `lecture-dl --urls urls.txt --output Output --cookie 'PLAY_SESSION=...'`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use reqwest::cookie::Jar;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use lecture_dl::BatchJob;
use lecture_dl::discovery::{EmbeddedPlayerDiscovery, SourceList};
use lecture_dl::fetch::{FailurePolicy, LectureDownloader, ProgressEvent, ProgressObserver};


#[derive(Parser, Debug)]
#[command(version, about = "Download lecture-capture videos and merge their best-quality tracks")]
struct Cli {
    /// File listing one source page URL per line
    #[arg(long, value_name = "FILE", default_value = "urls.txt")]
    urls: PathBuf,

    /// Directory receiving the downloaded videos
    #[arg(short, long, value_name = "DIR", default_value = "Output")]
    output: PathBuf,

    /// Output container extension
    #[arg(long, default_value = "mp4")]
    container: String,

    /// Location of the ffmpeg binary
    #[arg(long, value_name = "PATH")]
    ffmpeg: Option<String>,

    /// Session cookie as name=value, sent to every source host (repeatable)
    #[arg(long = "cookie", value_name = "NAME=VALUE")]
    cookies: Vec<String>,

    /// Upper bound on each network request
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    fetch_timeout: Duration,

    /// Upper bound on the muxing of one video
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30m")]
    mux_timeout: Duration,

    /// Upper bound on loading a source page
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    discovery_timeout: Duration,

    /// Stop at the first failed video instead of continuing with the rest of the batch
    #[arg(long)]
    fail_fast: bool,

    /// Print debugging information
    #[arg(short, long)]
    verbose: bool,
}


struct ConsoleProgress;

impl ProgressObserver for ConsoleProgress {
    fn update(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::SourceStarted { index, total, url } => {
                if *index > 1 {
                    println!();
                }
                println!("URL {index} of {total}: {url}");
            },
            ProgressEvent::VideoStarted { index, total, .. } => {
                if *index > 1 {
                    println!("---");
                }
                println!("Downloading video {index} of {total}...");
            },
            ProgressEvent::StreamDownloading { ordinal, total, .. } =>
                println!("Downloading stream {ordinal} of {total}..."),
            ProgressEvent::Merging { .. } => println!("Merging..."),
            ProgressEvent::VideoDone { output } => println!("Video downloaded: {}", output.display()),
            ProgressEvent::VideoFailed { stage, message } => println!("Failed during {stage}: {message}"),
        }
    }
}


fn setup_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let default = if verbose { "debug,reqwest=warn,hyper=warn" } else { "info,reqwest=warn,hyper=warn" };
    let fmt_layer = fmt::layer()
        .compact()
        .with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn http_client(cli: &Cli, sources: &SourceList) -> Result<reqwest::Client> {
    let jar = Jar::default();
    for url in &sources.urls {
        let url = url.parse::<url::Url>().context("parsing source URL")?;
        for cookie in &cli.cookies {
            jar.add_cookie_str(cookie, &url);
        }
    }
    reqwest::Client::builder()
        .cookie_provider(Arc::new(jar))
        .build()
        .context("creating HTTP client")
}

async fn run(cli: Cli) -> Result<bool> {
    let sources = SourceList::from_file(&cli.urls)?;
    let client = http_client(&cli, &sources)?;
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            on_interrupt.cancel();
        }
    });
    let mut downloader = LectureDownloader::new(&cli.output)
        .with_http_client(client)
        .with_container(&cli.container)
        .with_fetch_timeout(cli.fetch_timeout)
        .with_mux_timeout(cli.mux_timeout)
        .with_cancellation(cancel)
        .add_progress_observer(Arc::new(ConsoleProgress))
        .with_failure_policy(if cli.fail_fast { FailurePolicy::Abort } else { FailurePolicy::Continue });
    if let Some(ffmpeg) = &cli.ffmpeg {
        downloader = downloader.with_ffmpeg(ffmpeg);
    }
    let discovery = EmbeddedPlayerDiscovery::new().with_timeout(cli.discovery_timeout);
    let summary = downloader.run(&BatchJob::new(sources.urls), &discovery).await?;
    for failure in &summary.failures {
        match failure.video {
            Some(n) => error!("{} (video {n}): {} failed: {}", failure.source_url, failure.stage, failure.message),
            None => error!("{}: {} failed: {}", failure.source_url, failure.stage, failure.message),
        }
    }
    println!("Done. {} videos downloaded, {} failures.", summary.completed.len(), summary.failures.len());
    Ok(summary.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        },
    }
}
