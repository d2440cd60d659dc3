use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use runvault_core::config::parse_duration;
use runvault_core::{naming, Config, SystemClock};
use runvault_kubehub::{JsonConverter, KubeResources, RunKind};
use runvault_persist::{Record, RecordStore, SqliteStore};
use runvault_reconcile::{Controller, ControllerConfig, Reconciler};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "runvaultctl", version, about = "Archive finished Tekton runs and query the archive")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace to watch, or to list records from (default: all)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Archive database path
    #[arg(long = "db", global = true, env = "RUNVAULT_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch runs and archive them until Ctrl-C
    Run {
        /// Run kinds to reconcile (taskrun, pipelinerun); repeatable
        #[arg(long = "kind")]
        kinds: Vec<RunKind>,
        /// Concurrent reconciles per kind
        #[arg(long = "workers")]
        workers: Option<usize>,
        /// Archive without writing correlation annotations back
        #[arg(long = "disable-annotation-update", action = ArgAction::SetTrue)]
        disable_annotation_update: bool,
        /// Delete unowned runs this long after completion, e.g. 10m or -1s; 0 disables
        #[arg(long = "completed-run-grace-period", value_parser = parse_duration, allow_hyphen_values = true)]
        completed_run_grace_period: Option<chrono::Duration>,
    },
    /// Query archived records
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RecordsCommand {
    /// List records under a result, or `<ns>/results/-` for a whole namespace
    List {
        parent: Option<String>,
        #[arg(long = "limit", default_value_t = 50)]
        limit: usize,
    },
    /// Show one record with its payload
    Get { name: String },
}

fn init_tracing() {
    let env = std::env::var("RUNVAULT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RUNVAULT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid RUNVAULT_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_store(db: Option<&str>) -> Result<SqliteStore> {
    match db {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { kinds, workers, disable_annotation_update, completed_run_grace_period } => {
            let kinds = if kinds.is_empty() { RunKind::ALL.to_vec() } else { kinds };
            let mut cfg = Config::from_env();
            cfg.disable_annotation_update |= disable_annotation_update;
            if let Some(g) = completed_run_grace_period {
                cfg.completed_run_grace_period = g;
            }
            let mut ccfg = ControllerConfig::from_env();
            if let Some(w) = workers {
                ccfg.workers = w;
            }
            run_controllers(kinds, cli.namespace, cli.db.as_deref(), cfg, ccfg).await?;
        }
        Commands::Records { command } => {
            let store = open_store(cli.db.as_deref())?;
            match command {
                RecordsCommand::List { parent, limit } => {
                    let parent = match (parent, cli.namespace.as_deref()) {
                        (Some(p), _) => p,
                        (None, Some(ns)) => naming::result_name(ns, naming::ANY_RESULT),
                        (None, None) => anyhow::bail!("records list needs a parent or --ns"),
                    };
                    let mut recs = store.list_records(&parent).await.with_context(|| format!("listing {}", parent))?;
                    recs.truncate(limit);
                    print_records(cli.output, &recs)?;
                }
                RecordsCommand::Get { name } => {
                    let rec = store.get_record(&name).await.with_context(|| format!("getting {}", name))?;
                    print_record(cli.output, &rec)?;
                }
            }
        }
    }

    Ok(())
}

async fn run_controllers(
    kinds: Vec<RunKind>,
    namespace: Option<String>,
    db: Option<&str>,
    cfg: Config,
    ccfg: ControllerConfig,
) -> Result<()> {
    let client = runvault_kubehub::get_kube_client().await?;
    let store: Arc<dyn RecordStore> = Arc::new(open_store(db)?);
    let cancel = CancellationToken::new();
    info!(
        kinds = ?kinds,
        ns = ?namespace,
        disable_annotation_update = cfg.disable_annotation_update,
        grace_secs = cfg.completed_run_grace_period.num_seconds(),
        workers = ccfg.workers,
        "starting controllers"
    );

    let mut controllers = JoinSet::new();
    let mut watchers = Vec::new();
    for kind in kinds {
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(KubeResources::new(client.clone(), kind)),
            Arc::clone(&store),
            Arc::new(JsonConverter),
            Arc::new(SystemClock),
            cfg.clone(),
        ));
        let (tx, rx) = mpsc::channel::<String>(ccfg.queue_cap);
        watchers.push(tokio::spawn({
            let client = client.clone();
            let ns = namespace.clone();
            let cancel = cancel.clone();
            async move {
                if let Err(e) = runvault_kubehub::start_watcher(client, kind, ns.as_deref(), tx).await {
                    error!(kind = %kind, error = ?e, "watcher failed");
                    cancel.cancel();
                }
            }
        }));
        controllers.spawn(Controller::new(reconciler, ccfg.clone()).run(rx, cancel.clone()));
    }

    tokio::select! {
        _ = signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
        _ = cancel.cancelled() => warn!("controller cancelled"),
    }
    cancel.cancel();
    for w in &watchers {
        w.abort();
    }

    let mut first_err = None;
    while let Some(res) = controllers.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = ?e, "controller failed");
                first_err.get_or_insert(e);
            }
            Err(e) => {
                first_err.get_or_insert_with(|| anyhow::anyhow!("controller task: {}", e));
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn print_records(output: Output, recs: &[Record]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<60} {:<28} {}", "NAME", "TYPE", "UPDATED");
            for r in recs {
                println!("{:<60} {:<28} {}", r.name, r.data.type_name, render_ts(r.update_time));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(recs)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(recs)?),
    }
    Ok(())
}

fn print_record(output: Output, rec: &Record) -> Result<()> {
    match output {
        Output::Human => {
            println!("name:    {}", rec.name);
            println!("parent:  {}", rec.parent);
            println!("uid:     {}", rec.uid);
            println!("type:    {}", rec.data.type_name);
            println!("created: {}", render_ts(rec.create_time));
            println!("updated: {}", render_ts(rec.update_time));
            println!("{}", serde_json::to_string_pretty(&rec.data.value)?);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(rec)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(rec)?),
    }
    Ok(())
}

fn render_ts(ts: chrono::DateTime<chrono::Utc>) -> String {
    let age = chrono::Utc::now().signed_duration_since(ts);
    let secs = age.num_seconds().max(0);
    let ago = if secs >= 86_400 {
        format!("{}d{}h", secs / 86_400, (secs % 86_400) / 3600)
    } else if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    };
    format!("{} ({} ago)", ts.format("%Y-%m-%dT%H:%M:%SZ"), ago)
}
