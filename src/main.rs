use clap::Parser;
use ldap_proxy::{run_metrics_server, Config, LdapProxy, Metrics, Rectifier, RuleTable, SessionConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, error};
use anyhow::{Context, Result};

#[derive(Parser)]
#[command(name = "ldap-proxy")]
#[command(version)]
#[command(about = "LDAP proxy - Forwards LDAP traffic to one upstream server, rewriting or answering messages that match configured byte patterns")]
struct Args {
    /// Configuration file path (defaults apply when omitted: listen :3000, upstream :4000, no rules)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config; e.g. :3000 or ldap://0.0.0.0:3389)
    #[arg(short = 'l', long, value_name = "ADDR")]
    local: Option<String>,

    /// Upstream server address (overrides config; e.g. :4000 or ldap://ldap1:389)
    #[arg(short = 'r', long, value_name = "ADDR")]
    remote: Option<String>,

    /// Trace logging with hex dumps of every frame
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    let verbose = args.verbose || config.verbose.unwrap_or(false);
    let log_level = if verbose { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_proxy={},info", log_level))
        .init();

    info!("Starting LDAP proxy v{}", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Configuration source: file {:?}", path),
        None => info!("Configuration source: defaults"),
    }

    let listen_url = args.local.clone().unwrap_or_else(|| config.listen.url.clone());
    let upstream_url = args.remote.clone().unwrap_or_else(|| config.upstream.url.clone());
    let rules = RuleTable::from_config(&config.rules).context("Invalid rectification rules")?;
    let session_config = SessionConfig::from_config(&config);

    info!("Configuration loaded:");
    info!("  Listen URL: {}", listen_url);
    info!("  Upstream URL: {}", upstream_url);
    info!("  Rules: {}", rules.len());
    for label in rules.labels() {
        info!("    - {}", label);
    }
    info!(
        "  Rectify: client->server {}, server->client {}",
        session_config.rectify_client_to_server, session_config.rectify_server_to_client
    );
    info!("  Max frame bytes: {}", session_config.max_frame_bytes);

    let metrics = Arc::new(Metrics::new());

    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        let upstream = upstream_url.clone();
        let rule_count = rules.len();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http, upstream, rule_count).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let proxy = LdapProxy::new(
        listen_url,
        upstream_url,
        Rectifier::new(rules),
        session_config,
        metrics,
    );

    tokio::select! {
        result = proxy.start() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C, shutting down");
        }
    }

    Ok(())
}
