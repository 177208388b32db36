//! CLI entry point for tunedl.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use tunedl_core::batch::download_batch;
use tunedl_core::cache::{FileStore, MemoryStore, MetadataStore};
use tunedl_core::download::{DownloadError, DownloadTarget, Downloader, ProgressUpdate};
use tunedl_core::exit::ProcessExit;
use tunedl_core::ident::TrackId;
use tunedl_core::options::{self, OptionLayer, ResolvedOptions};
use tunedl_core::provider::HttpProvider;
use tunedl_core::transcode::{FfmpegTranscoder, NullTranscoder, Transcoder};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let exit = run().await?;
    if exit != ProcessExit::Success {
        std::process::exit(exit.code());
    }
    Ok(())
}

async fn run() -> Result<ProcessExit> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let defaults = OptionLayer::builtin(cwd);
    let global = options::load_global_layer()?;
    let invocation = match &args.config {
        Some(path) => OptionLayer::from_file(path)?,
        None => OptionLayer::default(),
    };
    let overrides = args.overrides_layer();
    let options = options::resolve(&defaults, &global, &invocation, &overrides)?;

    // RUST_LOG env var wins over the resolved verbosity level.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(options.verbosity.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let provider = Arc::new(HttpProvider::new(provider_url(&args)?));
    let store = metadata_store();
    let transcoder = build_transcoder(&options)?;

    let token = CancellationToken::new();
    install_interrupt_handler(token.clone());

    let mut downloader = Downloader::new(provider, store, transcoder).with_cancellation(token);
    let progress_task = if options.quiet() {
        None
    } else {
        let (tx, rx) = mpsc::unbounded_channel();
        downloader = downloader.with_progress(tx);
        Some(tokio::spawn(render_progress(rx)))
    };

    let exit = if let Some(manifest_path) = &args.batch {
        run_batch(&downloader, manifest_path, &args, &options).await?
    } else {
        run_single(&downloader, &args, &options).await?
    };

    // Dropping the downloader closes the progress channel, which lets the
    // renderer finish cleanly.
    drop(downloader);
    if let Some(task) = progress_task {
        let _ = task.await;
    }

    Ok(exit)
}

async fn run_single(
    downloader: &Downloader,
    args: &Args,
    options: &ResolvedOptions,
) -> Result<ProcessExit> {
    let Some(raw) = args.target.as_deref() else {
        bail!("no download target given");
    };
    let id = TrackId::parse(raw)?;
    let mut target = DownloadTarget::new(id).with_resume(args.resume);
    if let Some(name) = &args.output_name {
        target = target.with_output_stem(name.clone());
    }

    match downloader.download(&target, options).await {
        Ok(result) => {
            let path = result
                .conversion
                .as_ref()
                .map_or(&result.output_path, |c| &c.output_path);
            info!(id = %result.id, path = %path.display(), "download complete");
            Ok(ProcessExit::Success)
        }
        Err(DownloadError::Interrupted) => {
            warn!("download interrupted");
            Ok(ProcessExit::Interrupted)
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_batch(
    downloader: &Downloader,
    manifest_path: &Path,
    args: &Args,
    options: &ResolvedOptions,
) -> Result<ProcessExit> {
    let manifest = std::fs::read_to_string(manifest_path).with_context(|| {
        format!(
            "failed to read batch manifest '{}'",
            manifest_path.display()
        )
    })?;

    let outcome = download_batch(downloader, &manifest, args.allow_raw_ids, options).await?;

    for (id, target) in &outcome.outcomes {
        if let Some(error) = &target.download_error {
            warn!(id = %id, error = %error, "target failed");
        } else if let Some(error) = &target.conversion_error {
            warn!(id = %id, error = %error, "target downloaded but conversion failed");
        }
    }
    info!(
        targets = outcome.outcomes.len(),
        failed_downloads = outcome.failed_downloads,
        failed_conversions = outcome.failed_conversions,
        interrupted = outcome.interrupted,
        "batch summary"
    );

    Ok(ProcessExit::from_batch(&outcome))
}

fn provider_url(args: &Args) -> Result<Url> {
    if let Some(url) = &args.provider_url {
        return Ok(url.clone());
    }
    if let Ok(raw) = std::env::var("TUNEDL_PROVIDER_URL") {
        return Url::parse(&raw).with_context(|| format!("invalid TUNEDL_PROVIDER_URL '{raw}'"));
    }
    bail!("no metadata provider configured; pass --provider-url or set TUNEDL_PROVIDER_URL")
}

fn metadata_store() -> Arc<dyn MetadataStore> {
    match FileStore::default_dir() {
        Some(dir) => Arc::new(FileStore::new(dir)),
        None => {
            warn!("no cache directory available, metadata cache is in-memory only");
            Arc::new(MemoryStore::new())
        }
    }
}

/// ffmpeg is required when conversion was requested; otherwise its
/// absence only disables resume duration checks.
fn build_transcoder(options: &ResolvedOptions) -> Result<Arc<dyn Transcoder>> {
    match FfmpegTranscoder::discover() {
        Ok(transcoder) => Ok(Arc::new(transcoder)),
        Err(e) if options.convert_audio => {
            Err(e).context("conversion requested but ffmpeg is unavailable")
        }
        Err(_) => {
            debug!("ffmpeg not found, resume duration checks disabled");
            Ok(Arc::new(NullTranscoder))
        }
    }
}

/// The first interrupt cancels the token; once this task has fired the
/// default signal disposition applies again, so a second interrupt kills
/// the process outright.
fn install_interrupt_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            token.cancel();
        }
    });
}

async fn render_progress(mut rx: mpsc::UnboundedReceiver<ProgressUpdate>) {
    let mut bar: Option<ProgressBar> = None;
    while let Some(update) = rx.recv().await {
        match update {
            ProgressUpdate::Started {
                title,
                total_bytes,
                resumed_from,
                ..
            } => {
                let next = match total_bytes {
                    Some(total) => {
                        let b = ProgressBar::new(total);
                        b.set_style(
                            ProgressStyle::with_template(
                                "{msg} [{wide_bar}] {bytes}/{total_bytes}",
                            )
                            .unwrap_or_else(|_| ProgressStyle::default_bar()),
                        );
                        b
                    }
                    None => ProgressBar::new_spinner(),
                };
                next.set_message(title);
                next.set_position(resumed_from);
                bar = Some(next);
            }
            ProgressUpdate::Advanced { written, .. } => {
                if let Some(bar) = &bar {
                    bar.set_position(written);
                }
            }
            ProgressUpdate::Converting { .. } => {
                if let Some(bar) = &bar {
                    bar.set_message("converting");
                }
            }
            ProgressUpdate::Finished { output_path, .. } => {
                if let Some(bar) = bar.take() {
                    bar.finish_with_message(format!("saved {}", output_path.display()));
                }
            }
        }
    }
}
