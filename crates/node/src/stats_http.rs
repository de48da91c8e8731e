use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::controller::Controller;

const MAX_REQUEST_BYTES: usize = 16384;
const NOT_FOUND_BODY: &str =
    "Error: Unknown endpoint. /stats & /debug are the only valid endpoint I understand.\r\n";

pub async fn bind_stats(addr: SocketAddr) -> Result<TcpListener, String> {
    TcpListener::bind(addr)
        .await
        .map_err(|err| format!("stats bind failed on {addr}: {err}"))
}

/// Serve `/stats` and `/debug` until shutdown. Snapshot bodies come from the
/// controller's thread-safe snapshot calls; a null snapshot renders `[null]`.
pub async fn serve_stats(
    controller: Arc<Controller>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = listener.local_addr().ok();
    if let Some(addr) = addr {
        log_info!("Stats HTTP listening on http://{addr}");
    }

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    log_warn!("stats accept failed: {err}");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };
        if *shutdown.borrow() {
            break;
        }
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, controller).await {
                log_debug!("stats request error: {err}");
            }
        });
    }
    if let Some(addr) = addr {
        log_info!("Stats HTTP on {addr} stopped");
    }
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    controller: Arc<Controller>,
) -> Result<(), String> {
    let mut buffer = vec![0u8; MAX_REQUEST_BYTES];
    let bytes_read = stream
        .read(&mut buffer)
        .await
        .map_err(|err| err.to_string())?;
    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let request_line = request.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or("/");
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };

    // Snapshot calls block on the controller thread; keep them off the
    // reactor.
    let (status, content_type, body) = match (method, path) {
        ("GET", "/stats") => {
            let controller = Arc::clone(&controller);
            let snapshot = tokio::task::spawn_blocking(move || controller.stats_safe())
                .await
                .unwrap_or(None);
            (
                "200 OK",
                "application/json; charset=utf-8",
                render_snapshot(snapshot),
            )
        }
        ("GET", "/debug") => {
            let params = parse_params(query);
            let controller = Arc::clone(&controller);
            let snapshot = tokio::task::spawn_blocking(move || controller.debug_safe(&params))
                .await
                .unwrap_or(None);
            (
                "200 OK",
                "application/json; charset=utf-8",
                render_snapshot(snapshot),
            )
        }
        _ => (
            "404 Not Found",
            "text/plain; charset=utf-8",
            NOT_FOUND_BODY.to_string(),
        ),
    };

    let response = build_response(status, content_type, &body);
    stream
        .write_all(&response)
        .await
        .map_err(|err| err.to_string())?;
    stream.shutdown().await.map_err(|err| err.to_string())?;
    Ok(())
}

/// `k=v&…` query parsing; malformed pairs are ignored.
fn parse_params(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        let mut kv = pair.split('=');
        match (kv.next(), kv.next(), kv.next()) {
            (Some(key), Some(value), None) if !key.is_empty() => {
                params.insert(key.to_string(), value.to_string());
            }
            _ => {}
        }
    }
    params
}

/// A null snapshot is still well-formed JSON on the wire: `[null]`.
fn render_snapshot(snapshot: Option<Value>) -> String {
    let value = match snapshot {
        Some(value) if !value.is_null() => value,
        _ => Value::Array(vec![Value::Null]),
    };
    let mut body = value.to_string();
    body.push_str("\r\n");
    body
}

fn build_response(status: &str, content_type: &str, body: &str) -> Vec<u8> {
    let mut response = String::new();
    response.push_str("HTTP/1.1 ");
    response.push_str(status);
    response.push_str("\r\nContent-Type: ");
    response.push_str(content_type);
    response.push_str("\r\nCache-Control: no-store\r\nConnection: close\r\nContent-Length: ");
    response.push_str(&body.len().to_string());
    response.push_str("\r\n\r\n");
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_ignore_malformed_pairs() {
        let params = parse_params("a=1&b=2&broken&=x&c=3=4&d=");
        assert_eq!(params.get("a").map(String::as_str), Some("1"));
        assert_eq!(params.get("b").map(String::as_str), Some("2"));
        assert_eq!(params.get("d").map(String::as_str), Some(""));
        assert!(!params.contains_key("broken"));
        assert!(!params.contains_key(""));
        assert!(!params.contains_key("c"));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn null_snapshot_renders_null_array() {
        assert_eq!(render_snapshot(None), "[null]\r\n");
        assert_eq!(render_snapshot(Some(Value::Null)), "[null]\r\n");
        assert_eq!(
            render_snapshot(Some(serde_json::json!({"ok": 1}))),
            "{\"ok\":1}\r\n"
        );
    }

    #[test]
    fn response_is_crlf_terminated_with_length() {
        let response = build_response("200 OK", "application/json; charset=utf-8", "[null]\r\n");
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 8\r\n"));
        assert!(text.ends_with("[null]\r\n"));
    }
}
