//! # TimeLoop
//!
//! Time capsule service: REST API, hourly unlock sweeper and notification
//! redelivery in one process.
//!
//! Usage:
//!   timeloop serve                        # API + sweeper + redelivery worker
//!   timeloop sweep                        # One sweep now, print the report
//!   timeloop sweep --now 2030-01-01T00:00:00Z
//!   timeloop redeliver                    # One pass over the retry queue
//!   timeloop init-config                  # Write a default config file

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use timeloop_core::TimeLoopConfig;
use timeloop_gateway::AppState;
use timeloop_scheduler::{
    Clock, Redeliverer, RedeliveryTimer, RetryPolicy, SweepSettings, SweepTimer, Sweeper,
    SystemClock, TimeLoopDb, dispatchers_from_config,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "timeloop",
    version,
    about = "⏳ TimeLoop: time capsules that open themselves"
)]
struct Cli {
    /// Config file (default: ~/.timeloop/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server with the unlock sweeper and redelivery worker
    Serve {
        /// Override server.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a single unlock sweep and print its report as JSON
    Sweep {
        /// Sweep as of this instant (RFC 3339) instead of the current time
        #[arg(long)]
        now: Option<String>,
    },
    /// Run a single redelivery pass and print its report as JSON
    Redeliver,
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Everything the scheduler needs, wired from config.
struct Runtime {
    db: Arc<TimeLoopDb>,
    clock: Arc<dyn Clock>,
    sweeper: Arc<Sweeper>,
    redeliverer: Arc<Redeliverer>,
}

impl Runtime {
    fn build(config: &TimeLoopConfig) -> Result<Self> {
        let db_path = config.database.resolved_path();
        let db = Arc::new(
            TimeLoopDb::open(&db_path)
                .with_context(|| format!("opening database {}", db_path.display()))?,
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dispatcher = Arc::new(dispatchers_from_config(config, db.clone(), clock.clone()));

        let settings = SweepSettings::from_config(config);
        let redeliverer = Arc::new(Redeliverer::new(
            db.clone(),
            dispatcher.clone(),
            RetryPolicy::from_config(&config.delivery),
            config.delivery.batch_size,
            settings.dispatch_timeout,
        ));
        let sweeper = Arc::new(
            Sweeper::new(db.clone(), dispatcher, db.clone(), settings)
                .with_instance_id(config.sweeper.instance_id.clone()),
        );

        tracing::info!("🗄️ Database: {}", db_path.display());
        Ok(Self {
            db,
            clock,
            sweeper,
            redeliverer,
        })
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TimeLoopConfig> {
    let config = match path {
        Some(p) => TimeLoopConfig::load_from(p),
        None => TimeLoopConfig::load(),
    };
    config.context("loading configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "timeloop=debug,timeloop_scheduler=debug,timeloop_gateway=debug,tower_http=debug"
    } else {
        "timeloop=info,timeloop_scheduler=info,timeloop_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::InitConfig { force } => {
            let path = cli.config.unwrap_or_else(TimeLoopConfig::default_path);
            if path.exists() && !force {
                println!("⚠️  {} already exists (use --force to overwrite)", path.display());
                return Ok(());
            }
            TimeLoopConfig::default().save_to(&path)?;
            println!("✅ Config written to {}", path.display());
            Ok(())
        }
        Command::Sweep { now } => {
            let config = load_config(cli.config.as_ref())?;
            let rt = Runtime::build(&config)?;
            let now = match now {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("invalid --now '{raw}'"))?
                    .with_timezone(&Utc),
                None => rt.clock.now(),
            };
            let report = rt
                .sweeper
                .sweep(now, &CancellationToken::new())
                .await
                .context("sweep failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Redeliver => {
            let config = load_config(cli.config.as_ref())?;
            let rt = Runtime::build(&config)?;
            let report = rt.redeliverer.run_once(rt.clock.now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Serve { port } => {
            let config = load_config(cli.config.as_ref())?;
            serve(config, port).await
        }
    }
}

async fn serve(config: TimeLoopConfig, port: Option<u16>) -> Result<()> {
    let rt = Runtime::build(&config)?;
    let cancel = CancellationToken::new();
    let port = port.unwrap_or(config.server.port);

    println!("⏳ TimeLoop v{}", env!("CARGO_PKG_VERSION"));
    println!("   🌐 API:       http://{}:{port}", config.server.host);
    println!(
        "   ⏰ Sweeper:   {}",
        if config.sweeper.enabled {
            format!("every {}s", config.sweeper.interval_secs)
        } else {
            "disabled".into()
        }
    );
    println!("   📨 Redelivery: every {}s", config.delivery.interval_secs);
    println!();

    let mut workers = Vec::new();
    if config.sweeper.enabled {
        let timer = SweepTimer::new(rt.sweeper.clone(), rt.clock.clone(), config.sweeper.interval());
        workers.push(tokio::spawn({
            let cancel = cancel.clone();
            async move {
                timer.run(cancel).await;
            }
        }));
    }
    let redelivery = RedeliveryTimer::new(
        rt.redeliverer.clone(),
        rt.clock.clone(),
        Duration::from_secs(config.delivery.interval_secs),
    );
    workers.push(tokio::spawn({
        let cancel = cancel.clone();
        async move {
            redelivery.run(cancel).await;
        }
    }));

    // Ctrl-C cancels the timers; the server drains on the same token.
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("🛑 Shutdown requested");
            }
            cancel.cancel();
        }
    });

    let state = Arc::new(AppState::new(rt.db.clone(), rt.clock.clone(), &config.server));
    let shutdown = cancel.clone().cancelled_owned();
    let served = timeloop_gateway::start(state, &config.server.host, port, shutdown).await;

    // A server error must still stop the timers.
    cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!("⚠️ Worker ended abnormally: {e}");
        }
    }
    served
}
