//! Read-only metrics HTTP endpoint.
//!
//! A minimal HTTP server on a dedicated thread with blocking I/O, serving
//! the metrics snapshot as JSON at `/stats` and in Prometheus exposition
//! format at `/metrics`. It only ever reads shared state.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::metrics::MetricsSnapshot;
use crate::shared::SharedStateHandle;

/// Start the stats HTTP server in a background thread.
pub fn start_stats_server(bind: SocketAddr, shared: SharedStateHandle) {
    thread::Builder::new()
        .name("http-stats".to_string())
        .spawn(move || {
            if let Err(e) = run_stats_server(bind, shared) {
                error!("stats HTTP server error: {}", e);
            }
        })
        .expect("failed to spawn stats thread");

    info!(
        "stats endpoint enabled at http://{}/stats and /metrics",
        bind
    );
}

fn run_stats_server(bind: SocketAddr, shared: SharedStateHandle) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind)?;

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_request(stream, &shared) {
                    debug!("stats request error: {}", e);
                }
            }
            Err(e) => {
                warn!("stats accept error: {}", e);
            }
        }
    }

    Ok(())
}

fn handle_request(mut stream: TcpStream, shared: &SharedStateHandle) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let mut reader = BufReader::new(&stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // "GET /stats HTTP/1.1"
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return send_response(&mut stream, 400, "Bad Request", "text/plain", "Invalid request");
    }

    let method = parts[0];
    let path = parts[1];

    if method != "GET" {
        return send_response(
            &mut stream,
            405,
            "Method Not Allowed",
            "text/plain",
            "Only GET is supported",
        );
    }

    // Drain remaining request headers.
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim().is_empty() {
            break;
        }
    }

    let snapshot = shared.metrics.snapshot();

    match path.trim_end_matches('/') {
        "/stats" => {
            let body = serde_json::to_string(&snapshot)
                .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e));
            send_response(&mut stream, 200, "OK", "application/json", &body)
        }
        "/metrics" => {
            let body = format_prometheus(&snapshot);
            send_response(
                &mut stream,
                200,
                "OK",
                "text/plain; version=0.0.4; charset=utf-8",
                &body,
            )
        }
        _ => send_response(
            &mut stream,
            404,
            "Not Found",
            "text/plain",
            "Use /stats or /metrics",
        ),
    }
}

fn send_response(
    stream: &mut TcpStream,
    status: u16,
    status_text: &str,
    content_type: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        content_type,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes())?;
    stream.flush()
}

/// Render the snapshot in Prometheus exposition format.
fn format_prometheus(snap: &MetricsSnapshot) -> String {
    let mut out = String::with_capacity(1024);

    out.push_str(&format!("broker_uptime_sec {}\n", snap.uptime_sec));
    out.push_str(&format!("broker_connects_total {}\n", snap.connects_total));
    out.push_str(&format!(
        "broker_disconnects_total {}\n",
        snap.disconnects_total
    ));
    out.push_str(&format!(
        "broker_subscribes_total {}\n",
        snap.subscribes_total
    ));
    out.push_str(&format!(
        "broker_publishes_total {}\n",
        snap.publishes_total
    ));
    out.push_str(&format!("broker_bytes_in_total {}\n", snap.bytes_in_total));
    out.push_str(&format!(
        "broker_bytes_out_total {}\n",
        snap.bytes_out_total
    ));

    for (label, count) in &snap.packet_count {
        out.push_str(&format!(
            "broker_packet_count{{type=\"{}\"}} {}\n",
            label, count
        ));
    }
    for (label, avg) in &snap.packet_avg_ms {
        out.push_str(&format!(
            "broker_packet_avg_ms{{type=\"{}\"}} {}\n",
            label, avg
        ));
    }
    for (label, max) in &snap.packet_max_ms {
        out.push_str(&format!(
            "broker_packet_max_ms{{type=\"{}\"}} {}\n",
            label, max
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SharedState;
    use std::sync::Arc;

    #[test]
    fn prometheus_format_contains_counters_and_labels() {
        let shared = Arc::new(SharedState::new());
        shared.metrics.incr_connects();
        shared.metrics.incr_publishes();
        shared.metrics.observe("PUBLISH", 1.5);
        shared.metrics.observe("TYPE_10", 0.5);

        let out = format_prometheus(&shared.metrics.snapshot());

        assert!(out.contains("broker_uptime_sec"));
        assert!(out.contains("broker_connects_total 1\n"));
        assert!(out.contains("broker_publishes_total 1\n"));
        assert!(out.contains("broker_packet_count{type=\"PUBLISH\"} 1\n"));
        assert!(out.contains("broker_packet_max_ms{type=\"PUBLISH\"} 1.5\n"));
        assert!(out.contains("broker_packet_count{type=\"TYPE_10\"} 1\n"));
    }

    #[test]
    fn stats_json_round_trips() {
        let shared = Arc::new(SharedState::new());
        shared.metrics.incr_subscribes();
        shared.metrics.observe("SUBSCRIBE", 2.0);

        let body = serde_json::to_string(&shared.metrics.snapshot()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(parsed["subscribes_total"], 1);
        assert_eq!(parsed["packet_count"]["SUBSCRIBE"], 1);
        assert_eq!(parsed["packet_avg_ms"]["SUBSCRIBE"], 2.0);
    }
}
