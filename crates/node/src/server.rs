use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use crate::options::{CertInfo, ListenerSpec, Transport};
use crate::session::{run_line_session, run_ws_session, SessionContext, SessionCore};
use crate::stats::ListenerStats;

const TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;
const WS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Bind a listener with the configured accept backlog.
pub fn bind_listener(spec: &ListenerSpec, backlog: u32) -> Result<TcpListener, String> {
    let socket = if spec.addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|err| format!("socket for {} failed: {err}", spec.addr))?;
    socket
        .set_reuseaddr(true)
        .map_err(|err| format!("reuseaddr for {} failed: {err}", spec.addr))?;
    socket.bind(spec.addr).map_err(|err| {
        format!(
            "failed to bind {} listener {}: {err}",
            spec.kind.as_str(),
            spec.addr
        )
    })?;
    socket
        .listen(backlog)
        .map_err(|err| format!("failed to listen on {}: {err}", spec.addr))
}

/// TLS acceptor for a listener. With `tls_disallow_deprecated` the protocol
/// set is pinned explicitly; the TLS stack never speaks anything below 1.2
/// either way.
pub fn make_tls_acceptor(
    cert: &CertInfo,
    disallow_deprecated: bool,
) -> Result<TlsAcceptor, String> {
    let builder = if disallow_deprecated {
        rustls::ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
    } else {
        rustls::ServerConfig::builder()
    };
    let config = builder
        .with_no_client_auth()
        .with_single_cert(cert.certs.clone(), cert.key.clone_key())
        .map_err(|err| {
            format!(
                "invalid certificate/key pair ({} / {}): {err}",
                cert.cert_file.display(),
                cert.key_file.display()
            )
        })?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept loop for one listener. Owns admission; accepted sockets are handed
/// to a session task which owns them thereafter.
pub async fn serve_listener(
    ctx: Arc<SessionContext>,
    spec: ListenerSpec,
    listener: TcpListener,
    stats: Arc<ListenerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let acceptor = match spec.cert.as_deref() {
        Some(cert) => match make_tls_acceptor(cert, ctx.options.tls_disallow_deprecated) {
            Ok(acceptor) => Some(acceptor),
            Err(err) => {
                log_critical!("{} {}: {err}", spec.kind.as_str(), spec.addr);
                return;
            }
        },
        None => None,
    };
    if spec.kind.is_encrypted() && acceptor.is_none() {
        log_critical!(
            "{} listener {} has no certificate material",
            spec.kind.as_str(),
            spec.addr
        );
        return;
    }
    log_info!("{} listening on {}", spec.kind.as_str(), spec.addr);

    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    log_warn!("{} accept failed: {err}", spec.kind.as_str());
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };
        if *shutdown.borrow() {
            break;
        }

        let exempt = ctx
            .options
            .is_ip_exempt_from_per_ip_limits(&remote_addr.ip());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = match ctx.registry.register(
            remote_addr,
            spec.kind,
            tx,
            ctx.options.max_clients_per_ip,
            exempt,
        ) {
            Ok(shared) => shared,
            Err(_) => {
                stats.note_rejected();
                log_debug!(
                    "Refusing client {remote_addr}: max_clients_per_ip reached ({})",
                    ctx.options.max_clients_per_ip
                );
                drop(stream);
                continue;
            }
        };
        stats.note_accepted();
        ctx.net_totals.inc_connections();
        log_debug!(
            "[{}] connected client #{} ({})",
            remote_addr,
            shared.id,
            spec.kind.as_str()
        );

        let ctx = Arc::clone(&ctx);
        let stats = Arc::clone(&stats);
        let acceptor = acceptor.clone();
        let kind = spec.kind;
        tokio::spawn(async move {
            let mut core = SessionCore::new(Arc::clone(&ctx), Arc::clone(&shared));
            let result = drive_session(kind, acceptor, stream, &mut core, rx).await;
            core.cleanup();
            stats.note_closed();
            ctx.net_totals.dec_connections();
            match result {
                Ok(()) => log_debug!(
                    "[{}] disconnected client #{}{}",
                    remote_addr,
                    shared.id,
                    core.close_reason()
                        .map(|r| format!(" ({r})"))
                        .unwrap_or_default()
                ),
                Err(err) => log_debug!("[{}] client #{} closed: {err}", remote_addr, shared.id),
            }
        });
    }
    log_info!("{} listener on {} stopped", spec.kind.as_str(), spec.addr);
}

async fn drive_session(
    kind: Transport,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
    core: &mut SessionCore,
    rx: tokio::sync::mpsc::UnboundedReceiver<crate::session::SessionMsg>,
) -> Result<(), String> {
    match kind {
        Transport::Tcp | Transport::Admin => run_line_session(stream, core, rx).await,
        Transport::Ssl => {
            let acceptor = acceptor.ok_or("TLS listener without certificate")?;
            let tls = timeout(
                Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SECS),
                acceptor.accept(stream),
            )
            .await
            .map_err(|_| "TLS handshake timed out".to_string())?
            .map_err(|err| format!("TLS handshake failed: {err}"))?;
            run_line_session(tls, core, rx).await
        }
        Transport::Ws => {
            let ws = timeout(
                Duration::from_secs(WS_HANDSHAKE_TIMEOUT_SECS),
                tokio_tungstenite::accept_async(stream),
            )
            .await
            .map_err(|_| "WebSocket handshake timed out".to_string())?
            .map_err(|err| format!("WebSocket handshake failed: {err}"))?;
            run_ws_session(ws, core, rx).await
        }
        Transport::Wss => {
            let acceptor = acceptor.ok_or("WSS listener without certificate")?;
            let tls = timeout(
                Duration::from_secs(TLS_HANDSHAKE_TIMEOUT_SECS),
                acceptor.accept(stream),
            )
            .await
            .map_err(|_| "TLS handshake timed out".to_string())?
            .map_err(|err| format!("TLS handshake failed: {err}"))?;
            let ws = timeout(
                Duration::from_secs(WS_HANDSHAKE_TIMEOUT_SECS),
                tokio_tungstenite::accept_async(tls),
            )
            .await
            .map_err(|_| "WebSocket handshake timed out".to_string())?
            .map_err(|err| format!("WebSocket handshake failed: {err}"))?;
            run_ws_session(ws, core, rx).await
        }
        Transport::Stats => Err("stats listeners are served by the HTTP server".to_string()),
    }
}
