use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing::{info, warn};

use vigil_cluster::{KindCache, KubeDiscovery, KubeObjects};
use vigil_core::SystemClock;
use vigil_store::{DeclStore, StoreConfig};
use vigil_wait::{WaitConfig, Waiter};

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Declare cluster resources and verify eventual state")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value = "human")]
    output: Output,

    /// Default namespace for namespaced declarations
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List kinds served under an apiVersion, e.g. "v1" or "apps/v1"
    Discover { api_version: String },
    /// Resolve one declared alias from a scenario file and print its object
    Get {
        /// Scenario file (YAML)
        scenario: std::path::PathBuf,
        alias: String,
    },
    /// Run a scenario: declare resources, wait for its checks, tear down
    Verify {
        /// Scenario file (YAML)
        scenario: std::path::PathBuf,
        /// Per-check wait timeout in seconds
        #[arg(long = "timeout", default_value_t = 3600)]
        timeout_secs: u64,
    },
}

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    resources: Vec<ResourceDecl>,
    #[serde(default)]
    checks: Vec<Check>,
}

#[derive(Debug, Deserialize)]
struct ResourceDecl {
    alias: String,
    kind: String,
    #[serde(rename = "apiVersion")]
    api_version: String,
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Check {
    expr: String,
    #[serde(default)]
    unless: Vec<String>,
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "VIGIL_METRICS_ADDR is not a socket address");
        }
    }
}

fn load_scenario(path: &std::path::Path) -> Result<Scenario> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading scenario {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing scenario {}", path.display()))
}

struct Engine {
    store: Arc<DeclStore>,
    waiter: Waiter,
}

async fn engine_for(scenario: &Scenario, ns_flag: Option<&str>, timeout_secs: u64) -> Result<Engine> {
    let client = kube::Client::try_default().await.context("loading kubeconfig")?;
    let clock = Arc::new(SystemClock);
    let cache = Arc::new(KindCache::new(
        Arc::new(KubeDiscovery::new(client.clone())),
        clock.clone(),
    ));
    let default_namespace = ns_flag
        .map(str::to_string)
        .or_else(|| scenario.namespace.clone())
        .unwrap_or_else(|| "default".to_string());
    let cfg = StoreConfig {
        default_namespace,
        params: scenario.params.clone(),
        ..StoreConfig::default()
    };
    let store = Arc::new(DeclStore::new(
        Arc::new(KubeObjects::new(client)),
        cache.clone(),
        cfg,
    ));
    for r in &scenario.resources {
        store.add(&r.alias, &r.kind, &r.api_version, &r.name, r.namespace.as_deref())?;
        info!(alias = %r.alias, kind = %r.kind, api_version = %r.api_version, "declared");
    }
    store.start_polling().await;
    let waiter = Waiter::new(
        store.clone(),
        cache,
        clock,
        WaitConfig { timeout: Duration::from_secs(timeout_secs), ..WaitConfig::default() },
    );
    Ok(Engine { store, waiter })
}

async fn cmd_discover(api_version: &str, output: Output) -> Result<()> {
    let client = kube::Client::try_default().await.context("loading kubeconfig")?;
    let cache = KindCache::new(Arc::new(KubeDiscovery::new(client)), Arc::new(SystemClock));
    let mut kinds = cache
        .resolve(api_version)
        .await
        .map_err(|e| e.into_discovery_error(api_version))?;
    kinds.sort_by(|a, b| a.kind.cmp(&b.kind));
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
        Output::Human => {
            for k in kinds {
                let scope = if k.namespaced { "namespaced" } else { "cluster" };
                println!("{:<40} {:<32} {}", k.kind, k.plural, scope);
            }
        }
    }
    Ok(())
}

async fn cmd_get(scenario: &Scenario, alias: &str, ns: Option<&str>, output: Output) -> Result<()> {
    let engine = engine_for(scenario, ns, 60).await?;
    let obj = engine.store.observed(alias);
    engine.store.stop_polling().await;
    match obj {
        Some(obj) if output == Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
        Some(obj) => println!("{}", serde_yaml::to_string(&obj)?),
        None => anyhow::bail!("resource {alias} is not observed"),
    }
    Ok(())
}

async fn cmd_verify(scenario: &Scenario, ns: Option<&str>, timeout_secs: u64) -> Result<()> {
    let engine = engine_for(scenario, ns, timeout_secs).await?;
    let mut failure: Option<anyhow::Error> = None;
    for check in &scenario.checks {
        let unless: Vec<&str> = check.unless.iter().map(String::as_str).collect();
        info!(expr = %check.expr, "checking");
        if let Err(e) = engine.waiter.wait_until(&check.expr, &unless).await {
            failure = Some(e.into());
            break;
        }
        info!(expr = %check.expr, "ok");
    }
    // teardown runs regardless of check outcome
    if let Err(e) = engine.store.delete_created().await {
        warn!(error = %e, "teardown incomplete");
    }
    engine.store.stop_polling().await;
    match failure {
        Some(e) => Err(e.context("verification failed")),
        None => {
            info!(checks = scenario.checks.len(), "all checks passed");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Discover { api_version } => cmd_discover(api_version, cli.output).await,
        Commands::Get { scenario, alias } => {
            let scenario = load_scenario(scenario)?;
            cmd_get(&scenario, alias, cli.namespace.as_deref(), cli.output).await
        }
        Commands::Verify { scenario, timeout_secs } => {
            let scenario = load_scenario(scenario)?;
            cmd_verify(&scenario, cli.namespace.as_deref(), *timeout_secs).await
        }
    }
}
