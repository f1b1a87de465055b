//! Traffic statistics shared by every session, with Prometheus and JSON rendering.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::ldap_protocol::InterceptedOp;

/// Direction of a forwarded packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to target.
    Sent,
    /// Target to client.
    Received,
}

/// Point-in-time copy of all counters; also the `/stats` body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Rewritten requests by operation (`search`, `modify`, ...).
    pub intercepted: BTreeMap<String, u64>,
    pub rewrite_errors: u64,
}

/// All counters live behind one lock; every update happens inside it.
#[derive(Debug)]
pub struct TrafficStats {
    inner: Mutex<StatsSnapshot>,
}

impl Default for TrafficStats {
    fn default() -> Self {
        let intercepted = InterceptedOp::ALL
            .iter()
            .map(|op| (op.metric_name().to_string(), 0))
            .collect();
        Self {
            inner: Mutex::new(StatsSnapshot {
                intercepted,
                ..StatsSnapshot::default()
            }),
        }
    }
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_opened(&self) {
        let mut s = self.lock();
        s.connections_total += 1;
        s.connections_active += 1;
    }

    pub fn connection_closed(&self) {
        let mut s = self.lock();
        s.connections_active = s.connections_active.saturating_sub(1);
    }

    /// One packet forwarded in `direction`.
    pub fn record_packet(&self, direction: Direction, bytes: usize) {
        let mut s = self.lock();
        match direction {
            Direction::Sent => {
                s.packets_sent += 1;
                s.bytes_sent += bytes as u64;
            }
            Direction::Received => {
                s.packets_received += 1;
                s.bytes_received += bytes as u64;
            }
        }
    }

    pub fn record_intercept(&self, op: InterceptedOp) {
        *self
            .lock()
            .intercepted
            .entry(op.metric_name().to_string())
            .or_insert(0) += 1;
    }

    pub fn record_rewrite_error(&self) {
        self.lock().rewrite_errors += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.lock().clone()
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        out.push_str("# HELP ldap_obf_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_obf_connections_total counter\n");
        out.push_str(&format!("ldap_obf_connections_total {}\n", s.connections_total));

        out.push_str("# HELP ldap_obf_connections_active Client connections currently relayed.\n");
        out.push_str("# TYPE ldap_obf_connections_active gauge\n");
        out.push_str(&format!("ldap_obf_connections_active {}\n", s.connections_active));

        out.push_str("# HELP ldap_obf_packets_total LDAP messages forwarded by direction.\n");
        out.push_str("# TYPE ldap_obf_packets_total counter\n");
        out.push_str(&format!("ldap_obf_packets_total{{direction=\"sent\"}} {}\n", s.packets_sent));
        out.push_str(&format!("ldap_obf_packets_total{{direction=\"received\"}} {}\n", s.packets_received));

        out.push_str("# HELP ldap_obf_bytes_total Bytes forwarded by direction.\n");
        out.push_str("# TYPE ldap_obf_bytes_total counter\n");
        out.push_str(&format!("ldap_obf_bytes_total{{direction=\"sent\"}} {}\n", s.bytes_sent));
        out.push_str(&format!("ldap_obf_bytes_total{{direction=\"received\"}} {}\n", s.bytes_received));

        out.push_str("# HELP ldap_obf_intercepted_total Requests rewritten by operation.\n");
        out.push_str("# TYPE ldap_obf_intercepted_total counter\n");
        for (op, count) in &s.intercepted {
            out.push_str(&format!("ldap_obf_intercepted_total{{op=\"{}\"}} {}\n", op, count));
        }

        out.push_str("# HELP ldap_obf_rewrite_errors_total Intercepted requests forwarded unmodified after a rewrite failure.\n");
        out.push_str("# TYPE ldap_obf_rewrite_errors_total counter\n");
        out.push_str(&format!("ldap_obf_rewrite_errors_total {}\n", s.rewrite_errors));
        out
    }
}

/// Path of the first HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let mut parts = first_line.trim().split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Status line, body and content type for one request path.
fn respond(path: &str, stats: &TrafficStats) -> (&'static str, String, &'static str) {
    match path {
        "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
        "/metrics" => ("200 OK", stats.render(), "text/plain; charset=utf-8"),
        "/stats" => {
            let body = serde_json::to_string(&stats.snapshot())
                .unwrap_or_else(|_| r#"{"error":"serialize"}"#.to_string());
            ("200 OK", body, "application/json")
        }
        _ => (
            "404 Not Found",
            "Not found. Supported: GET /metrics, GET /stats, GET /health.\n".to_string(),
            "text/plain; charset=utf-8",
        ),
    }
}

/// Serve GET /metrics, /stats and /health on `addr` until the task is dropped.
pub async fn run_metrics_server(addr: &str, stats: Arc<TrafficStats>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;
    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;
    serve_metrics(listener, stats).await
}

async fn serve_metrics(listener: TcpListener, stats: Arc<TrafficStats>) -> Result<()> {
    info!(
        "Metrics server listening on http://{} (GET /metrics, /stats, /health)",
        listener.local_addr()?
    );
    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };
        let stats = Arc::clone(&stats);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");
            let (status, body, content_type) = respond(path, &stats);
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
    use tokio::net::TcpStream;

    #[test]
    fn test_request_path() {
        assert_eq!(request_path("GET /health HTTP/1.1"), "/health");
        assert_eq!(request_path("GET /stats HTTP/1.0"), "/stats");
        assert_eq!(request_path(""), "");
        assert_eq!(request_path("GET  HTTP/1.1"), "");
    }

    #[test]
    fn test_counters_and_render() {
        let stats = TrafficStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.record_packet(Direction::Sent, 40);
        stats.record_packet(Direction::Received, 10);
        stats.record_packet(Direction::Received, 5);
        stats.record_intercept(InterceptedOp::Search);
        stats.record_intercept(InterceptedOp::ModifyDn);
        stats.record_rewrite_error();

        let s = stats.snapshot();
        assert_eq!(s.connections_total, 2);
        assert_eq!(s.connections_active, 1);
        assert_eq!((s.packets_sent, s.bytes_sent), (1, 40));
        assert_eq!((s.packets_received, s.bytes_received), (2, 15));
        assert_eq!(s.intercepted["search"], 1);
        assert_eq!(s.intercepted["modify_dn"], 1);
        assert_eq!(s.intercepted["add"], 0);

        let out = stats.render();
        assert!(out.contains("ldap_obf_connections_total 2"));
        assert!(out.contains("ldap_obf_bytes_total{direction=\"received\"} 15"));
        assert!(out.contains("ldap_obf_intercepted_total{op=\"search\"} 1"));
        assert!(out.contains("ldap_obf_rewrite_errors_total 1"));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let stats = Arc::new(TrafficStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_packet(Direction::Sent, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().packets_sent, 4000);
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(TrafficStats::new());
        stats.record_intercept(InterceptedOp::Add);
        tokio::spawn(serve_metrics(listener, Arc::clone(&stats)));

        for (path, expect) in [
            ("/health", "ok"),
            ("/stats", "\"add\":1"),
            ("/metrics", "ldap_obf_intercepted_total{op=\"add\"} 1"),
            ("/nope", "404 Not Found"),
        ] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(format!("GET {} HTTP/1.1\r\n\r\n", path).as_bytes())
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            assert!(response.contains(expect), "{}: {}", path, response);
        }
    }
}
