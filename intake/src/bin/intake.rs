use std::{fmt::Write as _, net::SocketAddr, path::PathBuf, sync::Arc};

use clap::{Args, Parser, Subcommand};
use intake::{
    clock::RealClock,
    compression::TarGz,
    config::{self, ACCESS_TOKEN_KEY, DEFAULT_CONFIG_PATH, Store},
    dump,
    ingest::Ingest,
    rotation::{self, Engine, Policy},
    status,
    storage::HttpUploader,
};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    runtime::Builder,
    signal,
    task::JoinSet,
    time::{self, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::Error),
    #[error("Parsing Prometheus address failed: {0}")]
    PrometheusAddr(#[from] std::net::AddrParseError),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Rotation server returned an error: {0}")]
    Rotation(#[from] rotation::Error),
    #[error("Could not join a spawned task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Registration(#[from] intake_signal::RegisterError),
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run intake with the specified configuration
    Run(RunArgs),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckArgs),
}

#[derive(Args)]
struct RunArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,
    /// directory dump sessions are written under
    #[clap(long, default_value = dump::DEFAULT_ROOT)]
    data_dir: PathBuf,
    /// socket to bind the prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<String>,
    /// read newline-delimited JSON events from stdin
    #[clap(long)]
    stdin: bool,
    /// seconds between polls of the configuration file
    #[clap(long, default_value_t = 1)]
    config_poll_seconds: u64,
}

#[derive(Args)]
struct ConfigCheckArgs {
    /// path on disk to the configuration file
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    config_path: PathBuf,
}

fn access_token() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

async fn feed_stdin(ingest: Ingest) {
    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("stdin closed");
                return;
            }
            Err(err) => {
                error!("Could not read stdin: {err}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let event: Value = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!(%err, "skipping malformed event line");
                continue;
            }
        };
        match ingest.process(&event).await {
            Ok(response) => debug!(
                status = response.status_code,
                errors = ?response.errors,
                "event processed"
            ),
            Err(err) => error!("Could not accept event: {err}"),
        }
    }
}

async fn inner_main(args: RunArgs) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = intake_signal::signal();

    if let Some(addr) = &args.prometheus_addr {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "prometheus exporter listening");
    }

    let store = Arc::new(Store::load(&args.config_path).await?);
    store
        .update_system_generated(ACCESS_TOKEN_KEY, Value::from(access_token()))
        .await?;
    if store.current().web_status_apis_enabled {
        info!(
            path = %args.config_path.display(),
            "status APIs enabled, access token written to systemGenerated.{ACCESS_TOKEN_KEY}"
        );
    } else {
        debug!("status APIs disabled");
    }

    let status = status::Handle::new();
    let status_server = status::Server::new(
        status.clone(),
        RealClock::default(),
        shutdown_watcher.register()?,
    );

    let engine = Engine::new(Policy::default(), TarGz::default(), HttpUploader::new());
    let dumps = dump::Manager::new(&args.data_dir);
    let (rotation_server, rotation) = rotation::Server::new(
        engine,
        dumps,
        store.subscribe(),
        RealClock::default(),
        shutdown_watcher.register()?,
    );
    let ingest = Ingest::new(rotation, status, store.subscribe());

    let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();
    tasks.spawn(async move {
        status_server.spin().await;
        Ok(())
    });
    let rotation_task = tokio::spawn(rotation_server.spin());
    {
        let store = Arc::clone(&store);
        let watcher = shutdown_watcher.register()?;
        let period = Duration::from_secs(args.config_poll_seconds.max(1));
        tasks.spawn(async move {
            store.watch(period, watcher).await;
            Ok(())
        });
    }
    if args.stdin {
        let _stdin = tokio::spawn(feed_stdin(ingest));
    }

    // A watcher left alive here would stall `signal_and_wait` forever.
    drop(shutdown_watcher);
    let mut interval = time::interval(Duration::from_millis(400));
    let res = loop {
        tokio::select! {
            _ = interval.tick() => {
                gauge!("intake.running").set(1.0);
            }
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            }
            Some(res) = tasks.join_next() => {
                match res {
                    Ok(Ok(())) => debug!("task shut down"),
                    Ok(Err(err)) => {
                        error!("Task shut down unexpectedly: {err}");
                        break Err(err);
                    }
                    Err(err) => error!("Could not join a spawned task: {err}"),
                }
            }
        }
    };
    shutdown_broadcast.signal_and_wait().await;
    // The final sweep runs after the rotation server has let go of its
    // watcher.
    rotation_task.await??;
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting intake {version} run.");

    let args = match Cli::parse().command {
        Commands::Run(args) => args,
        Commands::ConfigCheck(args) => {
            let runtime = Builder::new_current_thread().enable_io().build()?;
            match runtime.block_on(Store::load(&args.config_path)) {
                Ok(_) => {
                    info!("Configuration file is valid");
                    std::process::exit(0)
                }
                Err(err) => {
                    error!("Configuration validation failed: {err}");
                    std::process::exit(1)
                }
            }
        }
    };

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(args));
    info!("Bye. :)");
    res
}
