use std::future::IntoFuture;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tether_api::{router, AppState, Bridge};
use tether_core::{object_key, Envelope, EventKind};
use tether_kubehub::{resources, KubeControlPlane, ResourceKind, ResourceWatch, WatchRegistry};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (required for watch and list)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve push streams over HTTP
    Serve {
        #[arg(long = "bind", env = "TETHER_BIND", default_value = "127.0.0.1:8080")]
        bind: String,
        /// Heartbeat period in milliseconds (0 disables)
        #[arg(long = "heartbeat-ms", env = "TETHER_HEARTBEAT_MS", default_value_t = 15_000)]
        heartbeat_ms: u64,
        /// Frames buffered per client before writes wait
        #[arg(long = "queue-cap", env = "TETHER_QUEUE_CAP", default_value_t = 256)]
        queue_cap: usize,
    },
    /// Watch one resource kind and print +/~/- events
    Watch {
        /// agents, models, tools or personas
        kind: ResourceKind,
        #[arg(short = 'l', long = "selector")]
        label_selector: Option<String>,
        #[arg(long = "field-selector")]
        field_selector: Option<String>,
        /// Re-list and re-watch after a terminal error
        #[arg(long = "reconnect", action = ArgAction::SetTrue)]
        reconnect: bool,
    },
    /// List one resource kind
    List {
        kind: ResourceKind,
        #[arg(short = 'l', long = "selector")]
        label_selector: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

async fn kube_registry() -> Result<WatchRegistry> {
    let upstream = KubeControlPlane::try_default().await?;
    Ok(WatchRegistry::new(Arc::new(upstream)))
}

fn require_namespace(ns: Option<String>) -> Result<String> {
    match ns.filter(|s| !s.trim().is_empty()) {
        Some(ns) => Ok(ns),
        None => bail!("--ns is required"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, heartbeat_ms, queue_cap } => serve(&bind, heartbeat_ms, queue_cap).await,
        Commands::Watch { kind, label_selector, field_selector, reconnect } => {
            let opts = ResourceWatch {
                namespace: Some(require_namespace(cli.namespace)?),
                label_selector,
                field_selector,
                ..Default::default()
            };
            info!(kind = %kind, ns = ?opts.namespace, reconnect, "watch invoked");
            watch(kind, opts, reconnect, cli.output).await
        }
        Commands::List { kind, label_selector } => {
            let opts = ResourceWatch {
                namespace: Some(require_namespace(cli.namespace)?),
                label_selector,
                ..Default::default()
            };
            info!(kind = %kind, ns = ?opts.namespace, "list invoked");
            let registry = kube_registry().await?;
            let list = resources::list_resource(&registry, kind, &opts).await.context("list failed")?;
            match cli.output {
                Output::Human => {
                    let items = list.get("items").and_then(|v| v.as_array()).map(Vec::as_slice).unwrap_or_default();
                    for item in items {
                        println!("{}", object_key(item));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
            Ok(())
        }
    }
}

async fn serve(bind: &str, heartbeat_ms: u64, queue_cap: usize) -> Result<()> {
    let registry = kube_registry().await?;
    let bridge = Bridge::new(registry.clone(), Duration::from_millis(heartbeat_ms));
    let app = router(AppState { bridge, queue_cap });
    let listener = tokio::net::TcpListener::bind(bind).await.with_context(|| format!("bind {}", bind))?;
    info!(addr = %bind, heartbeat_ms, queue_cap, "tether push server listening");

    // Push streams never finish on their own, so shutdown drops them instead of draining.
    tokio::select! {
        res = axum::serve(listener, app).into_future() => res.context("server failed")?,
        _ = signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
    }
    let stopped = registry.stop_all();
    warn!(stopped, "server ended (graceful shutdown)");
    Ok(())
}

fn print_event(env: &Envelope, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string(env)?),
        Output::Human => match env.kind {
            EventKind::Added => println!("+ {}", env.object_key()),
            EventKind::Modified => println!("~ {}", env.object_key()),
            EventKind::Deleted => println!("- {}", env.object_key()),
            EventKind::Error => println!("! {}", env.error.as_deref().unwrap_or("error")),
        },
    }
    Ok(())
}

enum Ended {
    Interrupted,
    /// Terminal error and the number of events seen before it.
    Failed(String, usize),
}

async fn stream_once(registry: &WatchRegistry, kind: ResourceKind, opts: &ResourceWatch, output: Output) -> Result<Ended> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let handle = resources::watch_resource(registry, kind, opts, tx).await;
    if let Some(err) = handle.connect_error() {
        return Ok(Ended::Failed(err.to_string(), 0));
    }
    let mut seen = 0usize;
    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(env) => {
                    print_event(&env, output)?;
                    if let Some(msg) = env.error {
                        return Ok(Ended::Failed(msg, seen));
                    }
                    seen += 1;
                }
                None => return Ok(Ended::Failed("watch ended".to_string(), seen)),
            },
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                handle.cancel();
                return Ok(Ended::Interrupted);
            }
        }
    }
}

/// Watch until Ctrl-C. With `reconnect`, a terminal error is followed by a
/// backoff, a fresh list, and a new watch from the list's resourceVersion.
async fn watch(kind: ResourceKind, base: ResourceWatch, reconnect: bool, output: Output) -> Result<()> {
    let registry = kube_registry().await?;
    let mut opts = base.clone();
    let mut backoff = Duration::from_secs(1);
    loop {
        let message = match stream_once(&registry, kind, &opts, output).await? {
            Ended::Interrupted => break,
            Ended::Failed(message, seen) => {
                if seen > 0 {
                    backoff = Duration::from_secs(1);
                }
                message
            }
        };
        if !reconnect {
            registry.stop_all();
            bail!("watch ended: {}", message);
        }
        warn!(error = %message, backoff_ms = backoff.as_millis() as u64, "watch ended; relisting");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = signal::ctrl_c() => break,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
        match resources::list_resource(&registry, kind, &base).await {
            Ok(list) => {
                let rv = list.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()).map(str::to_string);
                let count = list.get("items").and_then(|v| v.as_array()).map_or(0, |a| a.len());
                info!(rv = ?rv, count, "relisted");
                opts = ResourceWatch { resource_version: rv, ..base.clone() };
            }
            Err(e) => {
                error!(error = %e, "relist failed");
                opts = base.clone();
            }
        }
    }
    let stopped = registry.stop_all();
    warn!(stopped, "watch loop ended (graceful shutdown)");
    Ok(())
}
