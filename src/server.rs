use crate::metrics::Metrics;
use crate::rectifier::Rectifier;
use crate::session::{Session, SessionConfig};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, Instrument};
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;

pub struct LdapProxy {
    listen_url: String,
    upstream_url: String,
    rectifier: Rectifier,
    session_config: SessionConfig,
    metrics: Arc<Metrics>,
}

impl LdapProxy {
    pub fn new(
        listen_url: String,
        upstream_url: String,
        rectifier: Rectifier,
        session_config: SessionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            listen_url,
            upstream_url,
            rectifier,
            session_config,
            metrics,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let addr = parse_listen_url(&self.listen_url)?;

        info!("Starting LDAP proxy on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        self.serve(listener).await
    }

    /// Accept loop on an already bound listener. Never returns on its own; errors from a single
    /// accept or session are logged and the loop goes on.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let upstream: Arc<str> = parse_upstream_url(&self.upstream_url)?.into();
        let local = listener.local_addr().context("Listener has no local address")?;

        info!("LDAP proxy listening on {}", local);
        info!("Upstream server: {}", upstream);
        info!("Rectification rules: {}", self.rectifier.table().len());
        self.metrics.set_listening(true);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("Accepted connection from {}", peer_addr);
                    self.metrics.inc_connections();
                    let upstream = Arc::clone(&upstream);
                    let metrics = Arc::clone(&self.metrics);
                    let session = Session::new(
                        self.rectifier.clone(),
                        self.session_config,
                        Arc::clone(&self.metrics),
                    );
                    let span = info_span!("session", peer = %peer_addr);

                    tokio::spawn(
                        async move {
                            handle_client(stream, &upstream, session, &metrics).await;
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Dial upstream once and run the session. A failed dial drops the client connection.
async fn handle_client(client: TcpStream, upstream_addr: &str, session: Session, metrics: &Metrics) {
    let upstream = match TcpStream::connect(upstream_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            metrics.inc_dial_error();
            error!("Failed to connect to upstream {}: {}", upstream_addr, e);
            return;
        }
    };
    if let Err(e) = client.set_nodelay(true).and(upstream.set_nodelay(true)) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
    info!("Connected to upstream {}", upstream_addr);

    if let Err(e) = session.run(client, upstream).await {
        error!("Session error: {:#}", e);
    }
}

/// Strip an optional ldap:// scheme; anything else with a scheme is rejected.
fn strip_scheme(url: &str) -> Result<&str> {
    if let Some(rest) = url.strip_prefix("ldap://") {
        // Remove leading slashes if present
        return Ok(rest.trim_start_matches('/'));
    }
    if url.starts_with("ldaps://") {
        bail!("ldaps:// is not supported, the proxy forwards plain LDAP only: {}", url);
    }
    if url.contains("://") {
        bail!("Invalid URL scheme, expected ldap:// or host:port: {}", url);
    }
    Ok(url)
}

fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    let url = strip_scheme(url.trim())?;

    if url.starts_with(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = url.trim_start_matches(':')
            .parse()
            .context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

/// Normalize the upstream URL to a `host:port` string for `TcpStream::connect`.
/// `:port` means the local host; host names are resolved at dial time.
fn parse_upstream_url(url: &str) -> Result<String> {
    let url = strip_scheme(url.trim())?;
    let (host, port) = url
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("Upstream address needs a port: {}", url))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid upstream port: {}", url))?;
    if port == 0 {
        bail!("Invalid upstream port: {}", url);
    }
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok(format!("{}:{}", host, port))
}
