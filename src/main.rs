use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::info;
use pagediff::diff::{DiffOptions, DEFAULT_TOLERANCE};
use pagediff::orchestrator::{CompareOptions, MismatchPolicy, Orchestrator};
use pagediff::server::ServerConfig;
use pagediff::store::{FsResultStore, DEFAULT_PUBLIC_PREFIX};
use pagediff::RenderConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pagediff", version, about = "Render two URLs at several viewports and diff the screenshots")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the comparison API and stored artifacts over HTTP
    Serve {
        /// Address to listen on
        #[arg(long, env = "PAGEDIFF_BIND", default_value = "127.0.0.1:3000")]
        bind: SocketAddr,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Run a single comparison and print the report as JSON
    Compare {
        reference_url: String,
        test_url: String,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// Directory artifacts are written to
    #[arg(long, env = "PAGEDIFF_STORE_ROOT", default_value = "public/screenshots")]
    store_root: PathBuf,

    /// Path prefix returned for stored artifacts
    #[arg(long, env = "PAGEDIFF_PUBLIC_PREFIX", default_value = DEFAULT_PUBLIC_PREFIX)]
    public_prefix: String,

    /// Chrome/Chromium executable (autodetected if omitted)
    #[arg(long, env = "PAGEDIFF_CHROME")]
    chrome: Option<PathBuf>,

    /// Navigation plus network-idle budget per page, in milliseconds
    #[arg(long, env = "PAGEDIFF_NAVIGATION_TIMEOUT_MS", default_value_t = 30000)]
    navigation_timeout_ms: u64,

    /// Quiet period required before capturing, in milliseconds
    #[arg(long, env = "PAGEDIFF_SETTLE_MS", default_value_t = 500)]
    settle_ms: u64,

    /// Per-pixel matching tolerance in [0, 1]
    #[arg(long, env = "PAGEDIFF_TOLERANCE", default_value_t = DEFAULT_TOLERANCE)]
    tolerance: f64,

    /// Viewports processed in parallel (capped at the CPU count)
    #[arg(long, env = "PAGEDIFF_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Fail instead of padding when reference and test heights differ
    #[arg(long)]
    strict_dimensions: bool,

    /// Abort a comparison after this many milliseconds
    #[arg(long, env = "PAGEDIFF_RUN_TIMEOUT_MS")]
    run_timeout_ms: Option<u64>,

    /// Disable the Chrome sandbox (needed in some containers)
    #[arg(long, env = "PAGEDIFF_NO_SANDBOX")]
    no_sandbox: bool,
}

impl PipelineArgs {
    fn build(&self) -> anyhow::Result<Arc<Orchestrator>> {
        let render = RenderConfig {
            chrome_path: self.chrome.clone(),
            navigation_timeout_ms: self.navigation_timeout_ms,
            settle_ms: self.settle_ms,
            sandbox: !self.no_sandbox,
            ..Default::default()
        };
        let options = CompareOptions {
            diff: DiffOptions {
                tolerance: self.tolerance,
                ..Default::default()
            },
            concurrency: self.concurrency.clamp(1, num_cpus::get().max(1)),
            mismatch_policy: if self.strict_dimensions {
                MismatchPolicy::Fail
            } else {
                MismatchPolicy::Pad
            },
            run_timeout_ms: self.run_timeout_ms,
            ..Default::default()
        };
        options.validate().context("invalid comparison options")?;

        let launcher = pagediff::default_launcher(render).context("invalid renderer configuration")?;
        let store = Arc::new(FsResultStore::with_prefix(&self.store_root, &self.public_prefix));
        info!(
            "Storing artifacts in {} (served under {})",
            self.store_root.display(),
            self.public_prefix
        );
        Ok(Arc::new(Orchestrator::new(launcher, store, options)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve { bind, pipeline } => {
            let orchestrator = pipeline.build()?;
            let config = ServerConfig {
                bind,
                public_prefix: pipeline.public_prefix.clone(),
            };
            pagediff::server::serve(orchestrator, config).await
        }
        Command::Compare {
            reference_url,
            test_url,
            pipeline,
        } => {
            let orchestrator = pipeline.build()?;
            let report = orchestrator
                .run(&reference_url, &test_url)
                .await
                .context("comparison failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
