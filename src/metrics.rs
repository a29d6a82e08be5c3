//! Метрики прокси в формате Prometheus: сессии, кадры по направлениям, срабатывания правил.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use anyhow::{Context, Result};
use tracing::{error, info};
use serde::Serialize;

use crate::pump::Direction;

/// Верхние границы корзин гистограммы длительности (в секундах). +Inf даётся отдельно как count.
const DURATION_BUCKETS: [f64; 11] = [
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Гистограмма: корзины + счётчик + сумма (в микросекундах).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        // Только одна корзина: первая, для которой secs <= le (некумулятивное хранение).
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Per-direction frame counters.
#[derive(Debug, Default)]
struct DirectionCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
    skipped: AtomicU64,
    rectified: AtomicU64,
    sent_back: AtomicU64,
    /// Read-to-write time of forwarded frames.
    duration: DurationHistogram,
}

/// Счётчики метрик (thread-safe, lock-free).
#[derive(Debug, Default)]
pub struct Metrics {
    /// Всего принятых клиентских подключений.
    pub connections_total: AtomicU64,
    pub active_sessions: AtomicU64,
    pub upstream_dial_errors: AtomicU64,
    /// Sessions that ended on a fatal error rather than a clean close.
    pub session_errors: AtomicU64,
    /// Set once the listener is bound; drives GET /ready.
    listening: AtomicBool,
    client_to_server: DirectionCounters,
    server_to_client: DirectionCounters,
    /// Rule label -> number of records it replaced.
    rule_matches: dashmap::DashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn direction(&self, direction: Direction) -> &DirectionCounters {
        match direction {
            Direction::ClientToServer => &self.client_to_server,
            Direction::ServerToClient => &self.server_to_client,
        }
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_dial_error(&self) {
        self.upstream_dial_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_session_error(&self) {
        self.session_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_ended(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::Relaxed);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    /// Учитывает принятый кадр и его размер.
    #[inline]
    pub fn observe_frame(&self, direction: Direction, bytes: usize) {
        let c = self.direction(direction);
        c.frames.fetch_add(1, Ordering::Relaxed);
        c.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Учитывает длительность обработки кадра (чтение завершено -> запись завершена).
    #[inline]
    pub fn observe_duration(&self, direction: Direction, duration: Duration) {
        self.direction(direction).duration.observe(duration);
    }

    #[inline]
    pub fn inc_skipped(&self, direction: Direction) {
        self.direction(direction).skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rectified(&self, direction: Direction) {
        self.direction(direction).rectified.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sent_back(&self, direction: Direction) {
        self.direction(direction).sent_back.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rule_match(&self, label: &str) {
        if let Some(counter) = self.rule_matches.get(label) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.rule_matches
            .entry(label.to_string())
            .or_insert_with(AtomicU64::default)
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn rule_matches(&self, label: &str) -> u64 {
        self.rule_matches
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Рендер метрик в текстовом формате Prometheus (exposition format).
    pub fn render(&self) -> String {
        let mut out = String::new();
        let c = self.connections_total.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_proxy_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_proxy_connections_total counter\n");
        out.push_str(&format!("ldap_proxy_connections_total {}\n", c));

        out.push_str("# HELP ldap_proxy_active_sessions Sessions with both connections open.\n");
        out.push_str("# TYPE ldap_proxy_active_sessions gauge\n");
        out.push_str(&format!("ldap_proxy_active_sessions {}\n", self.active_sessions()));

        let de = self.upstream_dial_errors.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_proxy_upstream_dial_errors_total Failed upstream connection attempts.\n");
        out.push_str("# TYPE ldap_proxy_upstream_dial_errors_total counter\n");
        out.push_str(&format!("ldap_proxy_upstream_dial_errors_total {}\n", de));

        let se = self.session_errors.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_proxy_session_errors_total Sessions ended by a fatal error.\n");
        out.push_str("# TYPE ldap_proxy_session_errors_total counter\n");
        out.push_str(&format!("ldap_proxy_session_errors_total {}\n", se));

        let directions = [
            (Direction::ClientToServer, &self.client_to_server),
            (Direction::ServerToClient, &self.server_to_client),
        ];
        let counters: [(&str, &str, fn(&DirectionCounters) -> u64); 5] = [
            ("ldap_proxy_frames_total", "Frames read by direction.", |c| c.frames.load(Ordering::Relaxed)),
            ("ldap_proxy_bytes_total", "Frame bytes read by direction.", |c| c.bytes.load(Ordering::Relaxed)),
            ("ldap_proxy_frames_skipped_total", "Frames dropped as structurally invalid (no children / bad message id).", |c| c.skipped.load(Ordering::Relaxed)),
            ("ldap_proxy_frames_rectified_total", "Frames with at least one rectified record.", |c| c.rectified.load(Ordering::Relaxed)),
            ("ldap_proxy_frames_sent_back_total", "Rectified frames routed back to their sender.", |c| c.sent_back.load(Ordering::Relaxed)),
        ];
        for (name, help, value) in counters.iter() {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            for (direction, c) in directions.iter() {
                out.push_str(&format!("{}{{direction=\"{}\"}} {}\n", name, direction, value(*c)));
            }
        }

        out.push_str("# HELP ldap_proxy_rule_matches_total Records replaced by each rectification rule.\n");
        out.push_str("# TYPE ldap_proxy_rule_matches_total counter\n");
        let mut rules: Vec<(String, u64)> = self
            .rule_matches
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        rules.sort();
        for (label, count) in rules {
            let escaped = label.replace('\\', "\\\\").replace('"', "\\\"");
            out.push_str(&format!("ldap_proxy_rule_matches_total{{rule=\"{}\"}} {}\n", escaped, count));
        }

        // Duration: гистограмма времени обработки кадра по направлениям
        out.push_str("# HELP ldap_proxy_frame_duration_seconds Time from frame read to write completion.\n");
        out.push_str("# TYPE ldap_proxy_frame_duration_seconds histogram\n");
        for (direction, c) in directions.iter() {
            let hist = &c.duration;
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_proxy_frame_duration_seconds_bucket{{direction=\"{}\",le=\"{}\"}} {}\n",
                    direction, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_proxy_frame_duration_seconds_bucket{{direction=\"{}\",le=\"+Inf\"}} {}\n",
                direction, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_proxy_frame_duration_seconds_sum{{direction=\"{}\"}} {}\n",
                direction, sum_secs
            ));
            out.push_str(&format!(
                "ldap_proxy_frame_duration_seconds_count{{direction=\"{}\"}} {}\n",
                direction, count
            ));
        }

        out
    }
}

/// Тело ответа GET /ready.
#[derive(Serialize)]
struct ReadyBody<'a> {
    ready: bool,
    upstream: &'a str,
    rules: usize,
    active_sessions: u64,
}

/// Извлекает путь из первой строки HTTP-запроса (например "GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Status line, body and content type for one request path.
fn respond(path: &str, metrics: &Metrics, upstream: &str, rules: usize) -> (&'static str, String, &'static str) {
    match path {
        "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
        "/ready" => {
            let ready = metrics.is_listening();
            let body_json = serde_json::to_string(&ReadyBody {
                ready,
                upstream,
                rules,
                active_sessions: metrics.active_sessions(),
            })
            .unwrap_or_else(|_| r#"{"ready":false,"error":"serialize"}"#.to_string());
            let status = if ready { "200 OK" } else { "503 Service Unavailable" };
            (status, body_json, "application/json")
        }
        "/metrics" => ("200 OK", metrics.render(), "text/plain; charset=utf-8"),
        _ => (
            "404 Not Found",
            "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
            "text/plain; charset=utf-8",
        ),
    }
}

/// Запускает HTTP-сервер для эндпоинтов GET /metrics, GET /health, GET /ready.
/// - /health (liveness): 200 если процесс жив.
/// - /ready (readiness): 200 когда прокси слушает порт, иначе 503.
pub async fn run_metrics_server(
    addr: &str,
    metrics: Arc<Metrics>,
    upstream: String,
    rules: usize,
) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    let upstream: Arc<str> = upstream.into();
    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let upstream = Arc::clone(&upstream);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if total >= 4 && buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request
                .lines()
                .next()
                .map(request_path)
                .unwrap_or("");

            let (status, body, content_type) = respond(path, &metrics, &upstream, rules);
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_path_health() {
        assert_eq!(request_path("GET /health HTTP/1.1"), "/health");
    }

    #[test]
    fn test_request_path_ready() {
        assert_eq!(request_path("GET /ready HTTP/1.0"), "/ready");
    }

    #[test]
    fn test_request_path_empty() {
        assert_eq!(request_path(""), "");
        assert_eq!(request_path("GET  HTTP/1.1"), "");
    }

    #[test]
    fn test_direction_counters_rendered() {
        let m = Metrics::default();
        m.inc_connections();
        m.observe_frame(Direction::ClientToServer, 56);
        m.observe_frame(Direction::ClientToServer, 10);
        m.inc_rectified(Direction::ClientToServer);
        m.inc_sent_back(Direction::ClientToServer);
        m.inc_skipped(Direction::ServerToClient);
        m.observe_duration(Direction::ClientToServer, Duration::from_micros(300));
        let out = m.render();
        assert!(out.contains("ldap_proxy_connections_total 1\n"));
        assert!(out.contains("ldap_proxy_frames_total{direction=\"client_to_server\"} 2\n"));
        assert!(out.contains("ldap_proxy_bytes_total{direction=\"client_to_server\"} 66\n"));
        assert!(out.contains("ldap_proxy_frames_rectified_total{direction=\"client_to_server\"} 1\n"));
        assert!(out.contains("ldap_proxy_frames_sent_back_total{direction=\"client_to_server\"} 1\n"));
        assert!(out.contains("ldap_proxy_frames_skipped_total{direction=\"server_to_client\"} 1\n"));
        assert!(out.contains(
            "ldap_proxy_frame_duration_seconds_bucket{direction=\"client_to_server\",le=\"0.0005\"} 1\n"
        ));
        assert!(out.contains(
            "ldap_proxy_frame_duration_seconds_count{direction=\"client_to_server\"} 1\n"
        ));
    }

    #[test]
    fn test_rule_matches_metric() {
        let m = Metrics::default();
        m.inc_rule_match("subschemaSubentry");
        m.inc_rule_match("subschemaSubentry");
        m.inc_rule_match("rename \"ou\"");
        assert_eq!(m.rule_matches("subschemaSubentry"), 2);
        assert_eq!(m.rule_matches("missing"), 0);
        let out = m.render();
        assert!(out.contains("ldap_proxy_rule_matches_total{rule=\"subschemaSubentry\"} 2\n"));
        assert!(out.contains("ldap_proxy_rule_matches_total{rule=\"rename \\\"ou\\\"\"} 1\n"));
    }

    #[test]
    fn test_active_sessions_gauge() {
        let m = Metrics::default();
        m.session_started();
        m.session_started();
        m.session_ended();
        assert_eq!(m.active_sessions(), 1);
        assert!(m.render().contains("ldap_proxy_active_sessions 1\n"));
    }

    #[test]
    fn test_ready_follows_listener() {
        let m = Metrics::default();
        let (status, body, content_type) = respond("/ready", &m, "127.0.0.1:4000", 2);
        assert_eq!(status, "503 Service Unavailable");
        assert_eq!(content_type, "application/json");
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["ready"], false);
        assert_eq!(json["rules"], 2);

        m.set_listening(true);
        let (status, body, _) = respond("/ready", &m, "127.0.0.1:4000", 2);
        assert_eq!(status, "200 OK");
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["ready"], true);
        assert_eq!(json["upstream"], "127.0.0.1:4000");
    }

    #[test]
    fn test_unknown_path() {
        let m = Metrics::default();
        let (status, _, _) = respond("/nope", &m, "", 0);
        assert_eq!(status, "404 Not Found");
        let (status, body, _) = respond("/health", &m, "", 0);
        assert_eq!(status, "200 OK");
        assert_eq!(body, "ok");
    }
}
