use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dvm_apply::{apply_manifest, apply_manifest_file, ApplyOptions, ApplyReport};
use dvm_core::{DeleteKind, ScaleRequest};
use dvm_kubehub::{parse_gvk_key, ClusterClient, DiscoverySnapshot, KubeCluster};
use dvm_ops::Ops;

#[derive(Parser, Debug)]
#[command(name = "dvmctl", version, about = "devops-manager cluster CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace for namespaced objects that do not declare one (default: "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List served resource kinds (incl. CRDs) with plural and scope
    Discover {
        /// Only resolve this kind, e.g. "apps/v1/Deployment" or "v1/ConfigMap"
        #[arg(long = "gvk")]
        gvk: Option<String>,
    },
    /// Create or replace every document of a YAML manifest
    Apply {
        /// Manifest path, or "-" for stdin
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
    },
    /// Set a Deployment's replica count
    Scale {
        name: String,
        #[arg(long = "replicas")]
        replicas: u32,
    },
    /// Delete a deployment, service, pod or configmap
    Delete {
        /// One of deployment|service|pod|configmap (aliases: deploy, svc, po, cm)
        kind: String,
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("DVM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DVM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DVM_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on Ctrl-C; in-flight cluster calls are abandoned, committed work stays.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf).context("reading manifest from stdin")?;
    Ok(buf)
}

fn print_report(report: &ApplyReport, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for o in &report.outcomes {
                match &o.result {
                    Ok(r) => {
                        let target = match &r.namespace {
                            Some(ns) => format!("{}/{}", ns, r.name),
                            None => r.name.clone(),
                        };
                        println!("{} {} {}", r.kind, target, r.action);
                    }
                    Err(e) => println!("document {}: error: {}", o.index, e),
                }
            }
            if report.cancelled {
                println!("cancelled: remaining documents were not applied");
            }
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Row<'a> {
                index: usize,
                kind: Option<&'a str>,
                name: Option<&'a str>,
                namespace: Option<&'a str>,
                action: Option<String>,
                error: Option<String>,
            }
            let rows: Vec<_> = report
                .outcomes
                .iter()
                .map(|o| match &o.result {
                    Ok(r) => Row {
                        index: o.index,
                        kind: Some(r.kind.as_str()),
                        name: Some(r.name.as_str()),
                        namespace: r.namespace.as_deref(),
                        action: Some(r.action.to_string()),
                        error: None,
                    },
                    Err(e) => Row {
                        index: o.index,
                        kind: o.kind.as_deref(),
                        name: o.name.as_deref(),
                        namespace: None,
                        action: None,
                        error: Some(e.to_string()),
                    },
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let namespace = cli.namespace.clone().unwrap_or_else(|| "default".to_string());

    let cluster = Arc::new(KubeCluster::try_default().await.context("connecting to cluster")?);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Discover { gvk: Some(key) } => {
            info!(gvk = %key, "discover invoked");
            let gvk = parse_gvk_key(&key)?;
            let snapshot = DiscoverySnapshot::fetch(cluster.as_ref()).await.context("discovery failed")?;
            let m = snapshot.resolve(&gvk)?;
            match cli.output {
                Output::Human => println!("{} • {} • {} • {}", m.api_version(), m.kind, m.plural, if m.namespaced() { "namespaced" } else { "cluster" }),
                Output::Json => println!("{}", serde_json::json!({ "apiVersion": m.api_version(), "kind": &m.kind, "plural": &m.plural, "namespaced": m.namespaced() })),
            }
        }
        Commands::Discover { gvk: None } => {
            info!("discover invoked");
            let mut resources = cluster.discover().await.context("discovery failed")?;
            resources.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {} • {}", gv, r.kind, r.plural, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Apply { file } => {
            info!(file = %file.display(), ns = %namespace, "apply invoked");
            let opts = ApplyOptions::from_env(cli.namespace.as_deref());
            let report = if file.as_os_str() == "-" {
                apply_manifest(cluster.as_ref(), &read_stdin()?, &opts, &cancel).await
            } else {
                apply_manifest_file(cluster.as_ref(), &file, &opts, &cancel)
                    .await
                    .with_context(|| format!("reading manifest {}", file.display()))?
            };
            print_report(&report, cli.output)?;
            if !report.is_success() {
                error!(failed = report.failed(), total = report.outcomes.len(), cancelled = report.cancelled, "apply incomplete");
                return Err(anyhow!("{} of {} documents failed", report.failed(), report.outcomes.len()));
            }
        }
        Commands::Scale { name, replicas } => {
            info!(ns = %namespace, name = %name, replicas, "scale invoked");
            let ops = Ops::new(cluster.clone());
            let req = ScaleRequest { namespace, name, replicas };
            let out = ops.scale(&req, &cancel).await?;
            match cli.output {
                Output::Human => println!("deployment {}/{} scaled to {} (attempts: {})", req.namespace, req.name, out.replicas, out.attempts),
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Commands::Delete { kind, name } => {
            info!(ns = %namespace, kind = %kind, name = %name, "delete invoked");
            let kind: DeleteKind = kind.parse()?;
            let ops = Ops::new(cluster.clone());
            ops.delete(&namespace, kind, &name, &cancel).await?;
            match cli.output {
                Output::Human => println!("{} {}/{} deleted", kind, namespace, name),
                Output::Json => println!("{}", serde_json::json!({ "kind": kind.as_str(), "namespace": namespace, "name": name, "deleted": true })),
            }
        }
    }

    Ok(())
}
