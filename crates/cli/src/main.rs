use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use kache_core::{InformerConfig, Resource};
use kache_informer::{Controller, HandlerFuncs, InformerError};
use kache_kubehub::KubeSource;
use kache_store::Store;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kachectl", version, about = "kache informer CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Path to a kubeconfig (default: in-cluster, then ~/.kube/config)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Periodic relist interval; 0 disables
    #[arg(long = "resync-secs", global = true, env = "KACHE_RESYNC_SECS")]
    resync_secs: Option<u64>,

    /// How long to wait for the initial sync
    #[arg(long = "wait-secs", global = true, env = "KACHE_WAIT_SECS", default_value_t = 8)]
    wait_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List cached objects of a kind once synced
    Ls {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
        gvk: String,
    },
    /// Print add/update/delete events for a kind until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
        gvk: String,
    },
}

type RunHandle = JoinHandle<Result<(), InformerError>>;

fn init_tracing() {
    let env = std::env::var("KACHE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KACHE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KACHE_METRICS_ADDR; expected host:port");
        }
    }
}

fn informer_config(cli: &Cli) -> InformerConfig {
    let config = InformerConfig::from_env();
    match cli.resync_secs {
        Some(0) => config.with_resync_period(None),
        Some(secs) => config.with_resync_period(Some(Duration::from_secs(secs))),
        None => config,
    }
}

async fn build_informer(cli: &Cli, gvk: &str) -> Result<Arc<Controller>> {
    let client = kache_kubehub::client_from(cli.kubeconfig.clone()).await?;
    let source = KubeSource::new(client, gvk, cli.namespace.as_deref())
        .await
        .with_context(|| format!("resolving {}", gvk))?;
    Ok(Arc::new(Controller::new(source, informer_config(cli))))
}

fn spawn_run(informer: &Arc<Controller>, token: &CancellationToken) -> RunHandle {
    let informer = Arc::clone(informer);
    let token = token.clone();
    tokio::spawn(async move { informer.run(token).await })
}

/// Wait for the first sync. Times out with a warning; fails if the informer died first.
async fn wait_synced(informer: &Controller, token: &CancellationToken, run: &mut RunHandle, wait: Duration) -> Result<()> {
    let synced = tokio::time::timeout(wait, informer.wait_for_cache_sync(token)).await.unwrap_or(false);
    if synced {
        info!(objects = informer.store().len(), "cache synced");
        return Ok(());
    }
    if run.is_finished() {
        run.await.context("informer task")?.context("informer failed")?;
        bail!("informer stopped before the cache synced");
    }
    warn!(wait_secs = wait.as_secs(), "cache not synced in time; output may be partial");
    Ok(())
}

async fn finish(informer: &Controller, run: RunHandle) -> Result<()> {
    informer.stop().await;
    run.await.context("informer task")?.context("informer failed")?;
    Ok(())
}

fn print_listing(store: &Store, output: Output) -> Result<()> {
    let mut items = store.list();
    items.sort_by(|a, b| a.key.cmp(&b.key));
    match output {
        Output::Human => {
            let now = Utc::now();
            for (idx, item) in items.iter().enumerate() {
                println!("{:>4} -> {:<48} {}", idx, item.key.to_string(), render_age(age_secs(item, now)));
            }
        }
        Output::Json => {
            let payloads: Vec<&serde_json::Value> = items.iter().map(|r| &r.payload).collect();
            println!("{}", serde_json::to_string_pretty(&payloads)?);
        }
    }
    Ok(())
}

fn age_secs(obj: &Resource, now: DateTime<Utc>) -> Option<i64> {
    let ts = obj.payload.get("metadata")?.get("creationTimestamp")?.as_str()?;
    let created = DateTime::parse_from_rfc3339(ts).ok()?;
    Some((now - created.with_timezone(&Utc)).num_seconds().max(0))
}

/// kubectl-style age: the largest unit plus the next one down, seconds alone under a minute.
fn render_age(secs: Option<i64>) -> String {
    let Some(secs) = secs.map(|s| s.max(0)) else { return "-".to_string() };
    let (d, h, m) = (secs / 86_400, secs % 86_400 / 3600, secs % 3600 / 60);
    match (d, h, m) {
        (0, 0, 0) => format!("{}s", secs),
        (0, 0, m) => format!("{}m", m),
        (0, h, m) => format!("{}h{}m", h, m),
        (d, h, _) => format!("{}d{}h", d, h),
    }
}

fn event_line(output: Output, event: &str, obj: &Resource, old: Option<&Resource>) -> String {
    match output {
        Output::Human => match old {
            Some(old) => format!("{} {} ({} -> {})", event, obj.key, old.version, obj.version),
            None => format!("{} {} ({})", event, obj.key, obj.version),
        },
        Output::Json => serde_json::json!({
            "event": event,
            "key": obj.key.to_string(),
            "version": obj.version.0,
            "old_version": old.map(|o| o.version.0),
        })
        .to_string(),
    }
}

/// The primary handler set prints every change; the secondary one only adds.
fn handler_sets(output: Output) -> (HandlerFuncs, HandlerFuncs) {
    let primary = HandlerFuncs::new()
        .on_add(move |obj| {
            println!("{}", event_line(output, "add", obj, None));
            Ok(())
        })
        .on_update(move |old, new| {
            println!("{}", event_line(output, "update", new, Some(old)));
            Ok(())
        })
        .on_delete(move |obj| {
            println!("{}", event_line(output, "delete", obj, None));
            Ok(())
        });
    let secondary = HandlerFuncs::new().on_add(move |obj| {
        println!("{}", event_line(output, "add2", obj, None));
        Ok(())
    });
    (primary, secondary)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let wait = Duration::from_secs(cli.wait_secs);

    match &cli.command {
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespace, "ls invoked");
            let informer = build_informer(&cli, gvk).await?;
            let token = CancellationToken::new();
            let mut run = spawn_run(&informer, &token);
            wait_synced(&informer, &token, &mut run, wait).await?;
            print_listing(&informer.store(), cli.output)?;
            finish(&informer, run).await?;
        }
        Commands::Watch { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespace, "watch invoked");
            let informer = build_informer(&cli, gvk).await?;
            let (primary, secondary) = handler_sets(cli.output);
            informer.add_listener(primary);
            informer.add_listener(secondary);
            let token = CancellationToken::new();
            let mut run = spawn_run(&informer, &token);
            wait_synced(&informer, &token, &mut run, wait).await?;
            print_listing(&informer.store(), cli.output)?;

            tokio::select! {
                res = signal::ctrl_c() => {
                    res.context("listening for Ctrl-C")?;
                    info!("Ctrl-C received; stopping informer");
                }
                joined = &mut run => {
                    joined.context("informer task")?.context("informer failed")?;
                    warn!("informer ended before Ctrl-C");
                    return Ok(());
                }
            }
            token.cancel();
            finish(&informer, run).await?;
        }
    }

    Ok(())
}
