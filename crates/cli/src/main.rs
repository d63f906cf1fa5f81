use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use kubus_api::{
    DeleteOptions, ExecOptions, ListOptions, LogOptions, PropagationPolicy, ResourceClient, SessionOutcome, WatchOptions,
};
use kubus_core::{ResourceDescriptor, ResourceInstance};
use kubus_kubehub::{KubeTransport, Transport};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kubusctl", version, about = "Kubus CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(short = 'n', long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PatchType { Merge, Strategic, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Cascade { Orphan, Background, Foreground }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch one object
    Get {
        /// Resource name, e.g. "pods", "po", "deployments.apps"
        resource: String,
        name: String,
    },
    /// List objects of a resource type
    Ls {
        resource: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        #[arg(long = "field-selector")]
        field_selector: Option<String>,
        /// List across all namespaces
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all_namespaces: bool,
    },
    /// Watch a resource type and print +/~/- events
    Watch {
        resource: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        /// Start from this resourceVersion
        #[arg(long = "rv")]
        resource_version: Option<String>,
        /// Server-side watch timeout in seconds
        #[arg(long = "timeout")]
        timeout_seconds: Option<u32>,
        /// Watch across all namespaces
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all_namespaces: bool,
    },
    /// Print or follow a pod's log
    Logs {
        pod: String,
        #[arg(short = 'c', long = "container")]
        container: Option<String>,
        #[arg(short = 'f', long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
        #[arg(long = "tail")]
        tail: Option<i64>,
        #[arg(long = "timestamps", action = ArgAction::SetTrue)]
        timestamps: bool,
        /// RFC3339 time, e.g. 2024-05-01T12:00:00Z
        #[arg(long = "since-time", value_parser = parse_time)]
        since_time: Option<DateTime<Utc>>,
    },
    /// Run a command in a pod's container
    Exec {
        pod: String,
        #[arg(short = 'c', long = "container")]
        container: Option<String>,
        /// Pass local stdin to the command
        #[arg(short = 'i', long = "stdin", action = ArgAction::SetTrue)]
        stdin: bool,
        /// Allocate a terminal; local terminal goes raw when combined with -i
        #[arg(short = 't', long = "tty", action = ArgAction::SetTrue)]
        tty: bool,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Patch one object
    Patch {
        resource: String,
        name: String,
        #[arg(long = "type", value_enum, default_value_t = PatchType::Strategic)]
        patch_type: PatchType,
        /// Patch document (JSON)
        #[arg(short = 'p', long = "patch")]
        patch: String,
    },
    /// Delete one object, or every object matching a selector
    Delete {
        resource: String,
        name: Option<String>,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        #[arg(long = "cascade", value_enum)]
        cascade: Option<Cascade>,
        #[arg(long = "grace-period")]
        grace_period: Option<i64>,
    },
}

fn init_tracing() {
    let env = std::env::var("KUBUS_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KUBUS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KUBUS_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)).map_err(|e| e.to_string())
}

const ALL_VERBS: &[&str] = &["create", "delete", "deletecollection", "get", "list", "patch", "update", "watch"];

/// Built-in resource types the CLI can address by plural, kind or short name.
fn builtin_resources() -> Vec<ResourceDescriptor> {
    fn d(gv: &str, plural: &str, kind: &str, namespaced: bool, short: &[&str]) -> ResourceDescriptor {
        ResourceDescriptor::new(gv, plural, kind, namespaced).with_verbs(ALL_VERBS).with_short_names(short)
    }
    vec![
        d("v1", "pods", "Pod", true, &["po"]).with_categories(&["all"]),
        d("v1", "services", "Service", true, &["svc"]).with_categories(&["all"]),
        d("v1", "configmaps", "ConfigMap", true, &["cm"]),
        d("v1", "secrets", "Secret", true, &[]),
        d("v1", "serviceaccounts", "ServiceAccount", true, &["sa"]),
        d("v1", "persistentvolumeclaims", "PersistentVolumeClaim", true, &["pvc"]),
        d("v1", "events", "Event", true, &["ev"]),
        d("v1", "namespaces", "Namespace", false, &["ns"]),
        d("v1", "nodes", "Node", false, &["no"]),
        d("v1", "persistentvolumes", "PersistentVolume", false, &["pv"]),
        d("apps/v1", "deployments", "Deployment", true, &["deploy"]).with_categories(&["all"]),
        d("apps/v1", "replicasets", "ReplicaSet", true, &["rs"]).with_categories(&["all"]),
        d("apps/v1", "statefulsets", "StatefulSet", true, &["sts"]).with_categories(&["all"]),
        d("apps/v1", "daemonsets", "DaemonSet", true, &["ds"]).with_categories(&["all"]),
        d("batch/v1", "jobs", "Job", true, &[]).with_categories(&["all"]),
        d("batch/v1", "cronjobs", "CronJob", true, &["cj"]).with_categories(&["all"]),
    ]
}

/// Accepts `pods`, `pod`, `Pod`, `po`, `deployments.apps` and `pods/status`.
fn lookup_resource(key: &str) -> Result<ResourceDescriptor> {
    let (base, sub) = match key.split_once('/') {
        Some((b, s)) => (b, Some(s)),
        None => (key, None),
    };
    let (name, group) = match base.split_once('.') {
        Some((n, g)) => (n, Some(g)),
        None => (base, None),
    };
    let name = name.to_ascii_lowercase();
    let found = builtin_resources().into_iter().find(|d| {
        let group_ok = group.map_or(true, |g| d.group == g);
        group_ok
            && (d.name == name || d.kind.to_ascii_lowercase() == name || d.short_names.iter().any(|s| *s == name))
    });
    let d = found.ok_or_else(|| anyhow!("unknown resource type {key:?}"))?;
    Ok(match sub {
        Some(sub) => ResourceDescriptor::new(&d.group_version(), &format!("{}/{}", d.name, sub), &d.kind, d.namespaced)
            .with_verbs(&["get", "patch", "update"]),
        None => d,
    })
}

/// Client for `key`; without a namespace, collection calls span all namespaces.
fn resource_client(transport: Arc<dyn Transport>, key: &str, namespace: Option<&str>) -> Result<ResourceClient> {
    let client = ResourceClient::new(transport, lookup_resource(key)?);
    Ok(match namespace {
        Some(ns) => client.with_namespace(ns),
        None => client,
    })
}

fn render_age(created: Option<&str>) -> String {
    let Some(ts) = created.and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else { return "-".to_string() };
    let mut secs = (Utc::now() - ts.with_timezone(&Utc)).num_seconds().max(0);
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn print_items(output: Output, items: &[ResourceInstance]) -> Result<()> {
    match output {
        Output::Human => {
            for it in items {
                println!("{}\t{}", it.key(), render_age(it.metadata.creation_timestamp.as_deref()));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(items)?),
    }
    Ok(())
}

fn print_item(output: Output, item: &ResourceInstance) -> Result<()> {
    match output {
        Output::Human => println!("{}/{}", item.kind().unwrap_or("?").to_ascii_lowercase(), item.key()),
        Output::Json => println!("{}", serde_json::to_string_pretty(item)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let transport = KubeTransport::try_default().await.context("connecting to cluster")?;
    let default_ns = cli.namespace.clone().unwrap_or_else(|| transport.client().default_namespace().to_string());
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let client_for = |key: &str| resource_client(transport.clone(), key, Some(default_ns.as_str()));
    let collection_for = |key: &str, all: bool| resource_client(transport.clone(), key, (!all).then_some(default_ns.as_str()));

    match cli.command {
        Commands::Get { resource, name } => {
            let client = client_for(&resource)?;
            let obj = client.get(&name, None).await.with_context(|| format!("get {resource} {name}"))?;
            print_item(cli.output, &obj)?;
        }
        Commands::Ls { resource, selector, field_selector, all_namespaces } => {
            let client = collection_for(&resource, all_namespaces)?;
            let opts = ListOptions { label_selector: selector, field_selector };
            info!(resource = %resource, ns = ?client.namespace(), "ls invoked");
            let items = client.list(None, &opts).await.with_context(|| format!("list {resource}"))?;
            print_items(cli.output, &items)?;
        }
        Commands::Watch { resource, selector, resource_version, timeout_seconds, all_namespaces } => {
            let client = collection_for(&resource, all_namespaces)?;
            let opts = WatchOptions { resource_version, timeout_seconds, label_selector: selector, field_selector: None };
            let mut stream = client.watch(None, &opts).await.with_context(|| format!("watch {resource}"))?;
            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(ev)) => match cli.output {
                            Output::Human => {
                                let mark = match ev.event_type {
                                    kubus_core::EventType::Added => "+",
                                    kubus_core::EventType::Modified => "~",
                                    kubus_core::EventType::Deleted => "-",
                                    kubus_core::EventType::Bookmark => continue,
                                    kubus_core::EventType::Error => "!",
                                };
                                println!("{} {}", mark, ev.object.key());
                            }
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                        },
                        Some(Err(e)) => return Err(e).context("watch stream failed"),
                        None => {
                            info!(last_rv = ?stream.last_resource_version(), "watch ended");
                            break;
                        }
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; closing watch");
                        stream.close();
                        break;
                    }
                }
            }
        }
        Commands::Logs { pod, container, follow, tail, timestamps, since_time } => {
            let client = client_for("pods")?;
            let opts = LogOptions { container, follow, timestamps, tail_lines: tail, since_time };
            let mut stdout = std::io::stdout();
            let run = client.logs_to(&pod, None, &opts, |chunk| {
                stdout.write_all(&chunk.data)?;
                stdout.flush()?;
                Ok(())
            });
            tokio::select! {
                res = run => res.with_context(|| format!("logs {pod}"))?,
                _ = signal::ctrl_c() => info!("Ctrl-C received; stopping log stream"),
            }
        }
        Commands::Exec { pod, container, stdin, tty, command } => {
            let client = client_for("pods")?;
            let mut opts = ExecOptions::command(command).stdin(stdin).tty(tty).stderr(!tty);
            opts.container = container;
            let mut session = client.exec(&pod, None, opts)?.with_display(std::io::stdout(), std::io::stderr());
            let cancel = session.cancel_handle();
            let watcher = tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
            let report = session.run().await.with_context(|| format!("exec in {pod}"));
            watcher.abort();
            let report = report?;
            match &report.outcome {
                SessionOutcome::Status(s) if !s.success => {
                    warn!(reason = ?s.reason, message = ?s.message, "command failed");
                }
                SessionOutcome::TransportError(e) => eprintln!("connection error: {e}"),
                SessionOutcome::ClosedWithoutStatus => eprintln!("connection closed without exit status"),
                _ => {}
            }
            if let kubus_api::ExecReport { output: kubus_ops::ExecOutput::Collected(text), .. } = &report {
                print!("{text}");
            }
            let code = match &report.outcome {
                SessionOutcome::Status(s) => s.exit_code.unwrap_or(if s.success { 0 } else { 1 }),
                SessionOutcome::Cancelled => 130,
                _ => 1,
            };
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Patch { resource, name, patch_type, patch } => {
            let client = client_for(&resource)?;
            let obj = match patch_type {
                PatchType::Json => {
                    let ops: serde_json::Value = serde_json::from_str(&patch).context("patch is not valid JSON")?;
                    client.json_patch(&name, &ops, None).await
                }
                PatchType::Merge | PatchType::Strategic => {
                    client.merge_patch_bytes(&name, patch.into_bytes(), None, patch_type == PatchType::Strategic).await
                }
            }
            .with_context(|| format!("patch {resource} {name}"))?;
            print_item(cli.output, &obj)?;
        }
        Commands::Delete { resource, name, selector, cascade, grace_period } => {
            let client = client_for(&resource)?;
            let opts = DeleteOptions {
                propagation_policy: cascade.map(|c| match c {
                    Cascade::Orphan => PropagationPolicy::Orphan,
                    Cascade::Background => PropagationPolicy::Background,
                    Cascade::Foreground => PropagationPolicy::Foreground,
                }),
                grace_period_seconds: grace_period,
            };
            match (name, selector) {
                (Some(name), None) => {
                    let obj = client.delete(&name, None, &opts).await.with_context(|| format!("delete {resource} {name}"))?;
                    print_item(cli.output, &obj)?;
                }
                (None, Some(sel)) => {
                    let items = client
                        .delete_collection(None, &ListOptions::labels(sel), &opts)
                        .await
                        .with_context(|| format!("delete {resource} collection"))?;
                    print_items(cli.output, &items)?;
                }
                _ => return Err(anyhow!("delete needs exactly one of NAME or --selector")),
            }
        }
    }

    Ok(())
}
