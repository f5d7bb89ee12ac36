use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use podmeter_api::{InProcMeter, MeterApi};
use podmeter_core::{Clock, MeterConfig, SystemClock, UserId};
use podmeter_kubehub::{KubeUserDirectory, KubeWorkloads, NamespaceConvention, StaticDirectory, UserDirectory};
use podmeter_persist::{PodUsageRow, SqliteStore};
use podmeter_runtime::{decode_heartbeat, pump_lines, Collaborators, Coordinator, HeartbeatSource, LineSource, MemoryQueue};
use podmeter_store::{ShardedCache, UsageCache};
use serde::Serialize;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info, warn};

const STDIN_QUEUE_DEPTH: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "podmeterctl", version, about = "Workload usage metering")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database path (default: ~/.podmeter/podmeter.db)
    #[arg(long = "db", global = true, env = "PODMETER_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the metering daemon until Ctrl-C
    Run {
        #[arg(long = "poll-secs", env = "PODMETER_POLL_SECS")]
        poll_secs: Option<u64>,
        #[arg(long = "sync-secs", env = "PODMETER_SYNC_SECS")]
        sync_secs: Option<u64>,
        #[arg(long = "sweep-secs", env = "PODMETER_SWEEP_SECS")]
        sweep_secs: Option<u64>,
        #[arg(long = "retention-secs", env = "PODMETER_RETENTION_SECS")]
        retention_secs: Option<u64>,
        #[arg(long = "drain-secs", env = "PODMETER_DRAIN_TIMEOUT_SECS")]
        drain_secs: Option<u64>,
        /// Per-user namespace prefix (namespaces are `<prefix><user_id>`)
        #[arg(long = "namespace-prefix", env = "PODMETER_NAMESPACE_PREFIX")]
        namespace_prefix: Option<String>,
        /// Poll only these users instead of discovering namespaces
        #[arg(long = "user", value_delimiter = ',')]
        users: Vec<UserId>,
        /// Do not read heartbeats from stdin
        #[arg(long = "no-stdin", action = ArgAction::SetTrue)]
        no_stdin: bool,
    },
    /// Show durable usage for one user
    Report {
        #[arg(long = "user")]
        user: UserId,
        /// Restrict to one day (YYYY-MM-DD, UTC)
        #[arg(long = "day")]
        day: Option<String>,
    },
    /// Merge newline-delimited heartbeats into a scratch cache and print each result
    Merge {
        /// Input file; stdin when omitted or "-"
        file: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("PODMETER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PODMETER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PODMETER_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_store(db: Option<&str>) -> Result<SqliteStore> {
    match db {
        Some(p) => SqliteStore::open(p),
        None => SqliteStore::open_default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { poll_secs, sync_secs, sweep_secs, retention_secs, drain_secs, namespace_prefix, users, no_stdin } => {
            init_metrics();
            let mut cfg = MeterConfig::from_env();
            if let Some(s) = poll_secs { cfg.poll_interval = Duration::from_secs(s); }
            if let Some(s) = sync_secs { cfg.sync_interval = Duration::from_secs(s); }
            if let Some(s) = sweep_secs { cfg.sweep_interval = Duration::from_secs(s); }
            if let Some(s) = retention_secs { cfg.retention = Duration::from_secs(s); }
            if let Some(s) = drain_secs { cfg.drain_timeout = Duration::from_secs(s); }
            if let Some(p) = namespace_prefix { cfg.namespace_prefix = p; }
            let cfg = cfg.normalized();

            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let cache = Arc::new(ShardedCache::from_config(&cfg, clock.clone()));
            let store = Arc::new(open_store(cli.db.as_deref())?);
            let client = kube::Client::try_default().await.context("building kube client")?;
            let convention = NamespaceConvention::new(&cfg.namespace_prefix)?;
            let directory: Arc<dyn UserDirectory> = if users.is_empty() {
                Arc::new(KubeUserDirectory::new(client.clone(), convention))
            } else {
                Arc::new(StaticDirectory::for_users(&users, &convention))
            };
            let collab = Collaborators {
                cache,
                sink: store,
                lister: Arc::new(KubeWorkloads::new(client)),
                directory,
                clock,
            };

            let mut coord = Coordinator::new(cfg, collab);
            if !no_stdin {
                let (producer, queue) = MemoryQueue::new(STDIN_QUEUE_DEPTH);
                pump_lines(std::io::BufReader::new(std::io::stdin()), producer);
                coord = coord.with_heartbeats(Box::new(queue));
            }
            coord.start();
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "cannot listen for ctrl-c; stopping");
            }
            info!("stop requested");
            let report = coord.stop().await;
            match cli.output {
                Output::Human => println!(
                    "stopped • drained_in_time={} • flushed={} • failed={}",
                    report.drained_in_time, report.final_flush.processed, report.final_flush.failed
                ),
                Output::Json => println!(
                    "{}",
                    serde_json::json!({
                        "drained_in_time": report.drained_in_time,
                        "flushed": report.final_flush.processed,
                        "failed": report.final_flush.failed,
                    })
                ),
            }
        }
        Commands::Report { user, day } => {
            let day = day
                .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").map_err(|e| anyhow!("invalid --day {:?}: {}", d, e)))
                .transpose()?;
            let store = open_store(cli.db.as_deref())?;
            let rows = store.workload_rows(day, Some(user))?;
            let flushed = match day {
                Some(d) => store.user_total_on(user, d)?,
                None => store.user_total(user, None, None)?,
            };
            print_report(cli.output, &Report { user, day, rows, flushed_seconds: flushed })?;
        }
        Commands::Merge { file } => {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let cfg = MeterConfig::from_env();
            let cache = Arc::new(ShardedCache::from_config(&cfg, clock.clone()));
            let meter = InProcMeter::new(cache.clone(), clock, cfg.active_window);
            let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match file.as_deref() {
                None | Some("-") => Box::new(tokio::io::stdin()),
                Some(p) => Box::new(tokio::fs::File::open(p).await.with_context(|| format!("opening {}", p))?),
            };
            let mut source = LineSource::new(BufReader::new(reader));
            while let Some(delivery) = source.recv().await {
                source.ack(delivery.tag).await?;
                let obs = match decode_heartbeat(&delivery.payload) {
                    Ok(o) => o,
                    Err(e) => {
                        eprintln!("skip {}: {}", delivery.key, e);
                        continue;
                    }
                };
                let key = obs.key();
                let result = meter.record_observation(obs).await?;
                let record = cache.get_workload(&key)?;
                match cli.output {
                    Output::Human => println!(
                        "{} • {} • delta={} • total={}",
                        key,
                        result.label(),
                        result.delta(),
                        record.map(|r| r.total_seconds).unwrap_or(0)
                    ),
                    Output::Json => println!("{}", serde_json::json!({ "key": key.to_string(), "result": result, "record": record })),
                }
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct Report {
    user: UserId,
    day: Option<NaiveDate>,
    rows: Vec<PodUsageRow>,
    flushed_seconds: u64,
}

fn print_report(output: Output, report: &Report) -> Result<()> {
    match output {
        Output::Human => {
            println!("DAY         NAMESPACE   WORKLOAD             SECONDS");
            for r in &report.rows {
                println!("{:<11} {:<11} {:<20} {}", r.day, r.namespace, r.workload_id, r.total_seconds);
            }
            println!("user {} flushed seconds: {}", report.user, report.flushed_seconds);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}
