use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{config::Config, prelude::*};

mod cmd;
mod config;
mod data_url;
mod error;
mod metadata;
mod ocr;
mod paths;
mod prelude;
mod queue;
mod repository;
mod sync;
mod worker;

/// OCR documents at scale and relay them into a digital repository.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OCR_RELAY_DEFAULT_ROOT (optional): Storage root for un-namespaced paths.
  - OCR_RELAY_ROOT_<NAME> (optional): Storage root for namespace <name>.
  - OCR_RELAY_QUEUE_DB (optional): Task queue database URL.
  - OCR_RELAY_REPOSITORY_URL: Base URL of the digital repository.
  - OCR_RELAY_REPOSITORY_USER (optional): Repository login.
  - OCR_RELAY_REPOSITORY_PASSWORD (optional): Repository password.
  - OCR_RELAY_VISION_API_BASE (optional): OpenAI-compatible vision endpoint.
  - OCR_RELAY_VISION_API_KEY (optional): API key for the vision endpoint.
  - OCR_RELAY_MAX_ATTEMPTS (optional): Attempts before dead-lettering.
  - OCR_RELAY_CLAIM_LEASE_SECS (optional): Lease on claimed tasks before reclaim.
  - OCR_RELAY_CALL_TIMEOUT_SECS (optional): Timeout on each network call.
  - OCR_RELAY_POLL_INTERVAL_MS (optional): Worker poll interval when idle.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Add OCR tasks to the shared queue.
    Enqueue(cmd::enqueue::EnqueueOpts),
    /// Run a pool of workers, processing queued tasks until interrupted.
    Worker(cmd::worker::WorkerOpts),
    /// OCR one document and push it directly, bypassing the queue.
    Push(cmd::push::PushOpts),
    /// Inspect and control queued tasks.
    Tasks(cmd::tasks::TasksOpts),
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    let config = Config::from_env();

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Enqueue(opts) => cmd::enqueue::cmd_enqueue(&config, opts).await?,
        Cmd::Worker(opts) => cmd::worker::cmd_worker(&config, opts).await?,
        Cmd::Push(opts) => cmd::push::cmd_push(&config, opts).await?,
        Cmd::Tasks(opts) => cmd::tasks::cmd_tasks(&config, opts).await?,
    }
    Ok(())
}
