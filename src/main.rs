use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use schedscope::client::{self, ClientOptions};
use schedscope::config::{Config, Filters};
use schedscope::error::CollectError;
use schedscope::export::health::HealthMetrics;
use schedscope::identity::IdentityCache;
use schedscope::ring::SampleRing;
use schedscope::sampler::Sampler;
use schedscope::server::QueryServer;
use schedscope::taskstats::TaskstatsConn;

/// CPU and scheduling-delay profiler agent.
#[derive(Parser)]
#[command(name = "schedscope", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Fetch a sample window from a running agent and print a JSON summary.
    Client {
        /// Agent endpoint to fetch samples from.
        #[arg(long, default_value = "127.0.0.1:1971")]
        addr: String,

        /// Number of samples to summarize.
        #[arg(short = 'n', long, default_value_t = 300)]
        samples: u32,

        /// Fetch only system-wide samples.
        #[arg(long)]
        sys_only: bool,

        /// Kernel tick rate for display scaling.
        #[arg(long, default_value_t = 100)]
        jiffy_hz: u64,

        /// Nominal sampling interval assumed for --sys-only summaries.
        #[arg(long, default_value_t = 200)]
        interval_ms: u32,
    },
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("schedscope {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    if let Some(Command::Client {
        addr,
        samples,
        sys_only,
        jiffy_hz,
        interval_ms,
    }) = cli.command
    {
        let opts = ClientOptions {
            addr,
            samples,
            sys_only,
            jiffy_hz,
            fallback_interval_ms: interval_ms,
        };
        return rt.block_on(client::run(&opts));
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting schedscope",
    );

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Taskstats needs CAP_NET_ADMIN in practice; refuse to limp along
    // without it.
    //
    // Safety: geteuid has no failure modes or side effects.
    if unsafe { libc::geteuid() } != 0 {
        bail!("schedscope reads taskstats over netlink and must run as root");
    }

    let filters = Filters::from_config(&cfg).context("building sample filters")?;
    let conn = TaskstatsConn::open().context("opening taskstats socket")?;
    info!(family_id = conn.family_id(), "taskstats family discovered");

    let ring = Arc::new(SampleRing::new(cfg.ring_capacity, cfg.max_procs));
    let identities = Arc::new(IdentityCache::new());
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health.start().await.context("starting health metrics server")?;

    let cancel = CancellationToken::new();

    // The sampler gets a dedicated OS thread: it blocks on the netlink
    // socket and on precise interval sleeps. A fatal error is forwarded to
    // the supervisor, which turns it into a nonzero exit.
    let (fatal_tx, fatal_rx) = tokio::sync::oneshot::channel::<CollectError>();
    let sampler = Sampler::new(
        &cfg,
        filters,
        conn,
        Arc::clone(&ring),
        Arc::clone(&identities),
        Arc::clone(&health),
        cancel.clone(),
    );
    let sampler_thread = std::thread::Builder::new()
        .name("sampler".to_string())
        .spawn(move || {
            if let Err(e) = sampler.run() {
                error!(error = %e, "sampler terminated");
                let _ = fatal_tx.send(e);
            }
        })
        .context("spawning sampler thread")?;

    // Query endpoint.
    let bind = format!("{}:{}", cfg.rpc.host, cfg.rpc.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding query endpoint on {bind}"))?;
    let query = Arc::new(QueryServer::new(
        Arc::clone(&ring),
        Arc::clone(&identities),
        cfg.sampling_interval.as_millis() as u32,
        Arc::clone(&health),
    ));
    tokio::spawn(Arc::clone(&query).serve(listener, cancel.child_token()));

    spawn_stats_reporter(
        cancel.child_token(),
        Arc::clone(&ring),
        Arc::clone(&identities),
        cfg.stats_interval,
    );

    // Wait for a shutdown signal or a fatal sampler error.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    let fatal = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            None
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            None
        }
        received = fatal_rx => received.ok(),
    };

    cancel.cancel();
    health.stop().await?;

    // The sampler notices cancellation at its next wakeup.
    let _ = tokio::task::spawn_blocking(move || sampler_thread.join()).await;

    match fatal {
        Some(e) => Err(e.into()),
        None => {
            info!("schedscope stopped");
            Ok(())
        }
    }
}

/// Periodically logs ring and cache occupancy.
fn spawn_stats_reporter(
    cancel: CancellationToken,
    ring: Arc<SampleRing>,
    identities: Arc<IdentityCache>,
    interval: std::time::Duration,
) {
    if interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the log starts one
        // interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let entries = ring.len();
                    let identities = identities.len();
                    if entries == 0 && identities == 0 {
                        continue;
                    }
                    info!(ring_entries = entries, identities, "usage stats");
                }
            }
        }
    });
}
