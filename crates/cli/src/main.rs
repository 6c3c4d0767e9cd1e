use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use drydock_compose::{CmdComposeClient, DockerComposeClient};
use drydock_core::{EngineState, Facet, Manifest};
use drydock_engine::register_controllers;
use drydock_ops::{ClusterOps, KubeOps};
use drydock_store::{Action, Store};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

#[derive(Parser, Debug)]
#[command(name = "drydock", version, about = "drydock: keep dev workloads deployed while you edit")]
struct Cli {
    /// Manifest file
    #[arg(short = 'f', long = "file", global = true, env = "DRYDOCK_FILE", default_value = "drydock.yaml")]
    file: PathBuf,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch pods in (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy every manifest and keep it reconciled until Ctrl-C
    Up,
    /// Print the status facets of every manifest
    Status,
    /// Print the detected docker-compose version
    ComposeVersion,
    /// Follow the logs of a docker-compose manifest's service
    ComposeLogs {
        /// Manifest name
        manifest: String,
    },
}

fn init_tracing() {
    let env = std::env::var("DRYDOCK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DRYDOCK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DRYDOCK_METRICS_ADDR; expected host:port");
        }
    }
}

fn report_config_errors(loaded: &config::Loaded) {
    for (name, err) in &loaded.errors {
        error!(manifest = %name, error = %err, "manifest config error");
        eprintln!("config error in {}: {}", name, err);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Up => up(&cli).await,
        Commands::Status => status(&cli),
        Commands::ComposeVersion => {
            let client = CmdComposeClient::new(Vec::new());
            let v = client.version().await.context("detecting docker-compose version")?;
            match cli.output {
                Output::Human if v.build.is_empty() => println!("{}", v.canonical),
                Output::Human => println!("{} (build {})", v.canonical, v.build),
                Output::Json => println!("{}", serde_json::json!({ "version": v.canonical, "build": v.build })),
            }
            Ok(())
        }
        Commands::ComposeLogs { manifest } => compose_logs(&cli, manifest).await,
    }
}

async fn up(cli: &Cli) -> Result<()> {
    let loaded = config::load(&cli.file)?;
    report_config_errors(&loaded);

    let mut initial = EngineState::new();
    initial.secrets = loaded.secrets.clone();
    let store = Store::new(initial);
    for m in &loaded.manifests {
        store.dispatch(Action::ManifestUpsert(m.clone()));
    }
    info!(manifests = loaded.manifests.len(), file = %cli.file.display(), "manifests loaded");

    let compose = Arc::new(CmdComposeClient::new(Vec::new()));
    info!(path = %compose.compose_path().display(), "using docker-compose");
    if loaded.manifests.iter().any(|m| m.compose().is_some()) {
        // caches the version, which decides how `up` is invoked
        match compose.version().await {
            Ok(v) => info!(version = %v.canonical, build = %v.build, "docker-compose detected"),
            Err(e) => warn!(error = %e, "docker-compose version unavailable"),
        }
    }

    let kube = if loaded.manifests.iter().any(Manifest::is_k8s) {
        match kube::Client::try_default().await {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, "no kubernetes cluster; kubernetes manifests will not be watched");
                None
            }
        }
    } else {
        None
    };
    let ops = kube.clone().map(|c| Arc::new(KubeOps::new(c)) as Arc<dyn ClusterOps>);
    register_controllers(&store, ops, compose.clone());

    let ctx = CancellationToken::new();
    let watcher = kube.map(|client| {
        let store = store.clone();
        let ctx = ctx.clone();
        let ns = cli.namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = drydock_kubehub::watch_pods(client, ns.as_deref(), store, ctx).await {
                error!(error = ?e, "pod watcher failed");
            }
        })
    });
    let runner = {
        let store = store.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { store.run(ctx).await })
    };

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    ctx.cancel();
    let _ = runner.await;
    if let Some(w) = watcher {
        let _ = w.await;
    }

    let mut downed = HashSet::new();
    for dc in loaded.manifests.iter().filter_map(Manifest::compose) {
        if !downed.insert(dc.project.name.clone()) {
            continue;
        }
        if let Err(e) = compose.down(&dc.project).await {
            warn!(project = %dc.project.name, error = %e, "compose down failed");
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusRow<'a> {
    name: &'a str,
    port_forward_error: Option<&'a str>,
    facets: Vec<Facet>,
}

fn status(cli: &Cli) -> Result<()> {
    let loaded = config::load(&cli.file)?;
    report_config_errors(&loaded);
    let store = Store::new(EngineState::new());
    store.dispatch(Action::SetSecrets(loaded.secrets.clone()));
    for m in &loaded.manifests {
        store.dispatch(Action::ManifestUpsert(m.clone()));
    }
    let snap = store.snapshot();
    let rows: Vec<StatusRow<'_>> = snap
        .targets()
        .map(|t| StatusRow {
            name: t.name(),
            port_forward_error: t.state.port_forward_error.as_deref(),
            facets: t.facets(&snap.secrets),
        })
        .collect();
    match cli.output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Output::Human => {
            for row in rows {
                println!("{}", row.name);
                if let Some(e) = row.port_forward_error {
                    println!("  port-forward: {}", e);
                }
                for f in row.facets {
                    println!("  [{}]", f.name);
                    for line in f.value.lines() {
                        println!("    {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn compose_logs(cli: &Cli, manifest: &str) -> Result<()> {
    let loaded = config::load(&cli.file)?;
    let m = loaded
        .manifests
        .iter()
        .find(|m| m.name == manifest)
        .ok_or_else(|| anyhow!("no manifest named {:?} in {}", manifest, cli.file.display()))?;
    let dc = m.compose().ok_or_else(|| anyhow!("manifest {:?} is not a docker-compose manifest", manifest))?;

    let client = CmdComposeClient::new(Vec::new());
    let mut h = client.stream_logs(&dc.service_spec());
    let mut out = tokio::io::stdout();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                h.cancel.cancel();
                break;
            }
            item = h.rx.recv() => match item {
                Some(Ok(chunk)) => out.write_all(&chunk).await?,
                Some(Err(e)) => {
                    out.flush().await?;
                    return Err(e).context("compose logs");
                }
                None => break,
            },
        }
    }
    out.flush().await?;
    Ok(())
}
