use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use konform_api::{Engine, EngineConfig};
use konform_core::{Gvk, ObjectExt, Scope};
use konform_kubehub::{KubeStore, StoreClient};
use tokio::signal;
use tracing::{error, info, warn};

mod source;

#[derive(Parser, Debug)]
#[command(name = "konformctl", version, about = "Keep a cluster in line with a directory of manifests")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Reconcile only this namespace (default: the whole cluster)
    #[arg(long = "scope", global = true, env = "KONFORM_SCOPE")]
    scope: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile continuously until interrupted
    Run {
        /// Directory holding the declared manifests
        #[arg(long = "source")]
        source: PathBuf,
        /// Worker tasks draining the object queue
        #[arg(long = "workers", env = "KONFORM_WORKERS")]
        workers: Option<usize>,
        /// Seconds between full reloads and apply passes
        #[arg(long = "resync-secs", env = "KONFORM_RESYNC_SECS")]
        resync_secs: Option<u64>,
        /// Revision stamped on every declaration
        #[arg(long = "commit", env = "KONFORM_COMMIT", default_value = "")]
        commit: String,
    },
    /// Print what a pass would do against the live cluster
    Diff {
        #[arg(long = "source")]
        source: PathBuf,
        /// Also list identities that need nothing
        #[arg(long = "all", action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Print the kinds the source declares
    Kinds {
        #[arg(long = "source")]
        source: PathBuf,
        /// Check each kind against the API server
        #[arg(long = "served", action = ArgAction::SetTrue)]
        served: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KONFORM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KONFORM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KONFORM_METRICS_ADDR; expected host:port");
        }
    }
}

fn engine_config(scope: Option<String>) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(ns) = scope.filter(|s| !s.is_empty()) {
        config.scope = Scope::Namespace(ns);
    }
    config
}

async fn kube_store() -> Result<Arc<dyn StoreClient>> {
    let client = konform_kubehub::get_kube_client().await?;
    Ok(Arc::new(KubeStore::new(client)))
}

fn load(source: &Path) -> Result<Vec<konform_core::DynamicObject>> {
    source::load_dir(source).with_context(|| format!("loading source {}", source.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { source, workers, resync_secs, commit } => {
            let mut config = engine_config(cli.scope);
            if let Some(n) = workers.filter(|n| *n > 0) {
                config.workers = n;
            }
            if let Some(s) = resync_secs.filter(|s| *s > 0) {
                config.resync = Duration::from_secs(s);
            }
            info!(scope = %config.scope, workers = config.workers, resync_secs = config.resync.as_secs(), "run invoked");
            run(source, commit, config).await?;
        }
        Commands::Diff { source, all } => {
            let config = engine_config(cli.scope);
            info!(scope = %config.scope, source = %source.display(), "diff invoked");
            let objects = load(&source)?;
            let engine = Engine::new(kube_store().await?, config);
            engine.cache().update(objects, "").context("publishing declared state")?;
            let t0 = Instant::now();
            let (plan, res) = engine.plan().await;
            info!(entries = plan.len(), took_ms = %t0.elapsed().as_millis(), "plan computed");
            let plan: Vec<_> = plan.into_iter().filter(|p| all || p.op != konform_api::Operation::NoOp).collect();
            match cli.output {
                Output::Human => {
                    for p in &plan {
                        match &p.drift {
                            Some(d) => println!("{:<20} {} ({d})", p.op.as_str(), p.id),
                            None => println!("{:<20} {}", p.op.as_str(), p.id),
                        }
                    }
                }
                Output::Json => {
                    let rows: Vec<_> =
                        plan.iter().map(|p| serde_json::json!({ "id": p.id, "op": p.op.as_str(), "drift": p.drift })).collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
            let destructive = plan.iter().filter(|p| p.op.is_destructive()).count();
            eprintln!("{} change(s), {} deletion(s)", plan.iter().filter(|p| p.op != konform_api::Operation::NoOp).count(), destructive);
            if let Err(errs) = res {
                for e in errs.errors() {
                    eprintln!("error: {e}");
                }
            }
        }
        Commands::Kinds { source, served } => {
            let objects = load(&source)?;
            let mut kinds = BTreeSet::new();
            for obj in &objects {
                match obj.gvk() {
                    Ok(gvk) => {
                        kinds.insert(gvk);
                    }
                    Err(e) => warn!(error = %e, name = ?obj.metadata.name, "declaration without kind"),
                }
            }
            let served_kinds: Option<BTreeMap<Gvk, bool>> = if served {
                let client = konform_kubehub::get_kube_client().await?;
                let found = konform_kubehub::discover(client).await?;
                Some(found.into_iter().map(|(gvk, info)| (gvk, info.namespaced)).collect())
            } else {
                None
            };
            match cli.output {
                Output::Human => {
                    for gvk in &kinds {
                        match served_kinds.as_ref().map(|s| s.get(gvk)) {
                            None => println!("{gvk}"),
                            Some(Some(true)) => println!("{gvk} • namespaced"),
                            Some(Some(false)) => println!("{gvk} • cluster"),
                            Some(None) => println!("{gvk} • not served"),
                        }
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = kinds
                        .iter()
                        .map(|gvk| {
                            let served = served_kinds.as_ref().map(|s| s.contains_key(gvk));
                            serde_json::json!({ "kind": gvk.to_string(), "served": served })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
    }
    Ok(())
}

async fn run(source: PathBuf, commit: String, config: EngineConfig) -> Result<()> {
    let engine = Arc::new(Engine::new(kube_store().await?, config.clone()));
    let workers = engine.run_workers(config.workers);

    // Kinds a pass could not resolve are retried by the engine's recovery task.
    let mut resync = tokio::time::interval(config.resync);
    loop {
        tokio::select! {
            _ = resync.tick() => match load(&source) {
                Ok(objects) => {
                    if let Err(e) = engine.sync(objects, &commit).await {
                        warn!(error = %e, pending = ?engine.pending_kinds(), "sync finished with errors");
                    }
                }
                Err(e) => error!(error = ?e, "source unreadable; keeping the previous declared state"),
            },
            _ = signal::ctrl_c() => {
                info!("interrupt received; shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
    for w in workers {
        if let Err(e) = w.await {
            warn!(error = %e, "worker task failed");
        }
    }
    Ok(())
}
