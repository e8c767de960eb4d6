use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use dcop_core::ObjectKey;
use dcop_kubehub::ControllerConfig;
use dcop_reconcile::{load_pod_template, ReconcilerConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::info;

mod simulate;

use simulate::{parse_configs, SimulateOptions, SimulationReport};

#[derive(Parser, Debug)]
#[command(name = "dcopctl", version, about = "DeploymentConfig controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (run) or to default objects into (simulate)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// YAML PodTemplateSpec for created Deployments (default: $DCOP_POD_TEMPLATE, else busybox)
    #[arg(long = "pod-template", global = true)]
    pod_template: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run {
        /// Identities reconciled in parallel
        #[arg(long = "concurrency", env = "DCOP_CONCURRENCY")]
        concurrency: Option<u16>,
        /// Seconds before a requeued identity runs again
        #[arg(long = "requeue-secs", env = "DCOP_REQUEUE_SECS")]
        requeue_secs: Option<u64>,
        /// Seconds before a failed identity runs again
        #[arg(long = "error-backoff-secs", env = "DCOP_ERROR_BACKOFF_SECS")]
        error_backoff_secs: Option<u64>,
        /// Field manager recorded on writes
        #[arg(long = "field-manager", env = "DCOP_FIELD_MANAGER")]
        field_manager: Option<String>,
    },
    /// Reconcile one DeploymentConfig once and print the outcome
    Reconcile {
        /// Identity as namespace/name
        object: String,
    },
    /// Converge DeploymentConfigs from a YAML file in memory, without a cluster
    Simulate {
        /// Multi-document YAML of DeploymentConfig objects
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Stop after this many passes
        #[arg(long = "max-passes", default_value_t = 10)]
        max_passes: usize,
        /// Report spec replicas as available after every pass
        #[arg(long = "settle", action = ArgAction::SetTrue)]
        settle: bool,
    },
    /// Print the DeploymentConfig CRD manifest
    Crd,
}

fn init_tracing() {
    let env = std::env::var("DCOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DCOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DCOP_METRICS_ADDR; expected host:port");
        }
    }
}

static DNS1123_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").unwrap());

/// Parse `namespace/name`, both parts DNS-1123 labels.
fn parse_identity(s: &str) -> Result<ObjectKey> {
    let key = ObjectKey::parse(s).ok_or_else(|| anyhow!("invalid identity {:?} (expect namespace/name)", s))?;
    for (what, part) in [("namespace", &key.namespace), ("name", &key.name)] {
        if !DNS1123_LABEL.is_match(part) {
            return Err(anyhow!("invalid {} {:?}: must be a lowercase RFC 1123 label", what, part));
        }
    }
    Ok(key)
}

fn reconciler_config(template: Option<&PathBuf>) -> Result<ReconcilerConfig> {
    match template {
        Some(path) => Ok(ReconcilerConfig::default().with_pod_template(load_pod_template(path)?)),
        None => ReconcilerConfig::from_env(),
    }
}

#[derive(Serialize)]
struct ReconcileRow<'a> {
    object: String,
    phase: &'a str,
    requeue: bool,
}

fn print_report(report: &SimulationReport, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Human => {
            println!("PASS  OBJECT                          PHASE           REQUEUE");
            for p in &report.passes {
                let phase = p.phase.unwrap_or("error");
                println!("{:<5} {:<31} {:<15} {}", p.pass, p.object, phase, p.requeue);
                if let Some(e) = &p.error {
                    println!("      error: {}", e);
                }
            }
            println!();
            println!("OBJECT                          DESIRED  DEPLOYMENT  AVAILABLE");
            for o in &report.objects {
                let dep = o.deployment_replicas.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
                let avail = o.status_available.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
                println!("{:<31} {:<8} {:<11} {}", o.object, o.desired, dep, avail);
            }
            if !report.converged {
                println!("\nnot converged; raise --max-passes or use --settle");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { concurrency, requeue_secs, error_backoff_secs, field_manager } => {
            let mut cfg = ControllerConfig::from_env();
            if cli.namespace.is_some() {
                cfg.namespace = cli.namespace.clone();
            }
            if let Some(n) = concurrency { cfg.concurrency = n; }
            if let Some(s) = requeue_secs { cfg.requeue_delay = Duration::from_secs(s); }
            if let Some(s) = error_backoff_secs { cfg.error_backoff = Duration::from_secs(s); }
            if let Some(fm) = field_manager { cfg.field_manager = fm; }
            let rcfg = reconciler_config(cli.pod_template.as_ref())?;
            let client = kube::Client::try_default().await.context("connecting to cluster")?;
            let reconciler = dcop_kubehub::kube_reconciler(client.clone(), rcfg, &cfg);
            dcop_kubehub::run_controller(client, reconciler, cfg).await?;
        }
        Commands::Reconcile { object } => {
            let key = parse_identity(&object)?;
            info!(object = %key, "reconcile invoked");
            let cfg = ControllerConfig::from_env();
            let rcfg = reconciler_config(cli.pod_template.as_ref())?;
            let client = kube::Client::try_default().await.context("connecting to cluster")?;
            let reconciler = dcop_kubehub::kube_reconciler(client, rcfg, &cfg);
            let pass = reconciler.reconcile_pass(&key).await?;
            match cli.output {
                Output::Human => {
                    let next = if pass.outcome.requeue { "requeue" } else { "done" };
                    println!("{}: {} ({})", key, pass.phase.as_str(), next);
                }
                Output::Json => {
                    let row = ReconcileRow { object: key.to_string(), phase: pass.phase.as_str(), requeue: pass.outcome.requeue };
                    println!("{}", serde_json::to_string_pretty(&row)?);
                }
            }
        }
        Commands::Simulate { file, max_passes, settle } => {
            let yaml = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let ns = cli.namespace.as_deref().unwrap_or("default");
            let configs = parse_configs(&yaml, ns).with_context(|| format!("loading {}", file.display()))?;
            info!(objects = configs.len(), max_passes, settle, "simulate invoked");
            let rcfg = reconciler_config(cli.pod_template.as_ref())?;
            let report = simulate::simulate(configs, rcfg, &SimulateOptions { max_passes, settle }).await?;
            print_report(&report, cli.output)?;
        }
        Commands::Crd => print!("{}", dcop_kubehub::crd_yaml()?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_accepts_dns_labels() {
        assert_eq!(parse_identity("default/web-1").unwrap(), ObjectKey::new("default", "web-1"));
    }

    #[test]
    fn identity_rejects_malformed_input() {
        let long = format!("ns/{}", "a".repeat(64));
        for bad in ["web", "/web", "default/", "a/b/c", "Default/web", "ns/web_1", "ns/-web", long.as_str()] {
            assert!(parse_identity(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn cli_parses_simulate_flags() {
        let cli = Cli::try_parse_from(["dcopctl", "-o", "json", "simulate", "-f", "dc.yaml", "--settle", "--max-passes", "3"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Simulate { file, max_passes, settle } => {
                assert_eq!(file, PathBuf::from("dc.yaml"));
                assert_eq!(max_passes, 3);
                assert!(settle);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn explicit_pod_template_must_exist() {
        let e = reconciler_config(Some(&PathBuf::from("/nonexistent/tpl.yaml"))).unwrap_err();
        assert!(format!("{:#}", e).contains("/nonexistent/tpl.yaml"));
    }
}
