use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::controller::Controller;
use crate::options::{Options, ThrottleParams};
use crate::stats::PollStats;

const RPC_CONNECT_TIMEOUT_SECS: u64 = 10;
const RPC_REPLY_TIMEOUT_SECS: u64 = 30;
const MAX_RPC_REPLY_BYTES: usize = 64 * 1024 * 1024;

/// Last-seen chain tip plus the handful of upstream facts sessions serve
/// directly (genesis hash, relay fee). Written by the poller, read anywhere.
pub struct TipState {
    height: AtomicI64,
    header_hex: Mutex<String>,
    genesis: Mutex<String>,
    relay_fee_bits: AtomicU64,
}

impl Default for TipState {
    fn default() -> Self {
        Self {
            height: AtomicI64::new(-1),
            header_hex: Mutex::new(String::new()),
            genesis: Mutex::new(String::new()),
            relay_fee_bits: AtomicU64::new(1e-5_f64.to_bits()),
        }
    }
}

impl TipState {
    pub fn tip(&self) -> (i64, String) {
        let height = self.height.load(Ordering::Acquire);
        let hex = self
            .header_hex
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default();
        (height, hex)
    }

    pub fn set_tip(&self, height: i64, header_hex: &str) {
        if let Ok(mut hex) = self.header_hex.lock() {
            *hex = header_hex.to_string();
        }
        self.height.store(height, Ordering::Release);
    }

    pub fn genesis_hash(&self) -> String {
        self.genesis.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn set_genesis_hash(&self, hash: &str) {
        if let Ok(mut genesis) = self.genesis.lock() {
            *genesis = hash.to_string();
        }
    }

    pub fn relay_fee(&self) -> f64 {
        f64::from_bits(self.relay_fee_bits.load(Ordering::Relaxed))
    }

    pub fn set_relay_fee(&self, fee: f64) {
        self.relay_fee_bits.store(fee.to_bits(), Ordering::Relaxed);
    }
}

/// Outstanding-request throttle for the upstream link: refuse new requests at
/// `hi` in flight, admit again once the count decays below `lo`.
pub struct ThrottleGate {
    params: ThrottleParams,
    outstanding: AtomicU32,
    saturated: std::sync::atomic::AtomicBool,
}

impl ThrottleGate {
    pub fn new(params: ThrottleParams) -> Self {
        Self {
            params,
            outstanding: AtomicU32::new(0),
            saturated: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.params.decay.max(1) as u64)
    }

    pub fn try_acquire(&self) -> bool {
        let current = self.outstanding.load(Ordering::Acquire);
        if self.saturated.load(Ordering::Acquire) {
            // Once saturated the gate stays closed until the count decays
            // below lo.
            if current >= self.params.lo {
                return false;
            }
            self.saturated.store(false, Ordering::Release);
        }
        if current >= self.params.hi {
            self.saturated.store(true, Ordering::Release);
            return false;
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn release(&self) {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();
    }
}

/// Minimal JSON-RPC-over-HTTP client for the trusted upstream node. One
/// request per connection (`Connection: close`), HTTP Basic auth.
pub struct UpstreamClient {
    host: String,
    port: u16,
    tls: bool,
    auth: String,
    next_id: AtomicU64,
    pub gate: ThrottleGate,
}

impl UpstreamClient {
    pub fn new(options: &Options) -> Self {
        let auth = BASE64.encode(format!("{}:{}", options.rpcuser, options.rpcpassword));
        Self {
            host: options.bitcoind.0.clone(),
            port: options.bitcoind.1,
            tls: options.bitcoind_tls,
            auth,
            next_id: AtomicU64::new(1),
            gate: ThrottleGate::new(options.bitcoind_throttle),
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "1.0", "id": id, "method": method, "params": params})
            .to_string();
        let request = format!(
            "POST / HTTP/1.1\r\nHost: {host}:{port}\r\nAuthorization: Basic {auth}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
            host = self.host,
            port = self.port,
            auth = self.auth,
            len = body.len(),
        );

        let stream = timeout(
            Duration::from_secs(RPC_CONNECT_TIMEOUT_SECS),
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| format!("connect to {}:{} timed out", self.host, self.port))?
        .map_err(|err| format!("connect to {}:{} failed: {err}", self.host, self.port))?;

        let raw = if self.tls {
            let connector = tls_connector();
            let name = rustls::pki_types::ServerName::try_from(self.host.clone())
                .map_err(|_| format!("bad upstream host name: {}", self.host))?;
            let mut stream = connector
                .connect(name, stream)
                .await
                .map_err(|err| format!("upstream TLS handshake failed: {err}"))?;
            exchange(&mut stream, request.as_bytes()).await?
        } else {
            let mut stream = stream;
            exchange(&mut stream, request.as_bytes()).await?
        };

        let body = http_body(&raw)?;
        let reply: Value = serde_json::from_slice(body)
            .map_err(|err| format!("upstream returned invalid JSON: {err}"))?;
        if let Some(error) = reply.get("error") {
            if !error.is_null() {
                return Err(format!("upstream error: {error}"));
            }
        }
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| "upstream reply missing result".to_string())
    }
}

async fn exchange<S>(stream: &mut S, request: &[u8]) -> Result<Vec<u8>, String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream
        .write_all(request)
        .await
        .map_err(|err| format!("upstream write failed: {err}"))?;
    let mut raw = Vec::new();
    let read = timeout(Duration::from_secs(RPC_REPLY_TIMEOUT_SECS), async {
        let mut chunk = [0u8; 16384];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|err| format!("upstream read failed: {err}"))?;
            if n == 0 {
                return Ok::<(), String>(());
            }
            raw.extend_from_slice(&chunk[..n]);
            if raw.len() > MAX_RPC_REPLY_BYTES {
                return Err("upstream reply too large".to_string());
            }
        }
    })
    .await;
    match read {
        Ok(Ok(())) => Ok(raw),
        Ok(Err(err)) => Err(err),
        Err(_) => Err("upstream reply timed out".to_string()),
    }
}

fn http_body(raw: &[u8]) -> Result<&[u8], String> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or("malformed upstream HTTP reply")?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let status = head.lines().next().unwrap_or_default();
    if !status.contains("200") {
        return Err(format!("upstream HTTP error: {status}"));
    }
    Ok(&raw[split + 4..])
}

// The upstream node is explicitly trusted (it is the validation oracle), and
// self-signed RPC certificates are the norm; certificate identity is not
// verified on this link.
fn tls_connector() -> tokio_rustls::TlsConnector {
    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };

    #[derive(Debug)]
    struct TrustedNodeVerifier;

    impl ServerCertVerifier for TrustedNodeVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustedNodeVerifier))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// Poll the upstream node every `poll_interval_secs` for tip movement and fan
/// new tips out through the controller. Header/scripthash ingestion proper
/// happens elsewhere; this loop is the liveness heartbeat.
pub async fn poll_upstream_loop(
    client: Arc<UpstreamClient>,
    tip: Arc<TipState>,
    controller: Arc<Controller>,
    poll_stats: Arc<PollStats>,
    poll_interval_secs: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_millis((poll_interval_secs * 1000.0) as u64);
    let mut last_hash = String::new();
    let mut bootstrapped = false;

    loop {
        if *shutdown.borrow() {
            return;
        }

        if !client.gate.try_acquire() {
            poll_stats.note_throttled();
            tokio::select! {
                _ = tokio::time::sleep(client.gate.decay_interval()) => continue,
                _ = shutdown.changed() => return,
            }
        }
        let started = Instant::now();
        let outcome =
            poll_once(&client, &tip, &controller, &mut last_hash, &mut bootstrapped).await;
        client.gate.release();
        match outcome {
            Ok(()) => poll_stats.note_ok(started.elapsed().as_millis() as u64),
            Err(err) => {
                poll_stats.note_failed();
                log_debug!("upstream poll failed: {err}");
            }
        }
        if poll_stats.tip_height() != tip.tip().0 {
            poll_stats.set_tip_height(tip.tip().0);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn poll_once(
    client: &UpstreamClient,
    tip: &TipState,
    controller: &Controller,
    last_hash: &mut String,
    bootstrapped: &mut bool,
) -> Result<(), String> {
    if !*bootstrapped {
        let genesis = client.call("getblockhash", json!([0])).await?;
        if let Some(hash) = genesis.as_str() {
            tip.set_genesis_hash(hash);
        }
        if let Ok(info) = client.call("getnetworkinfo", json!([])).await {
            if let Some(fee) = info.get("relayfee").and_then(Value::as_f64) {
                tip.set_relay_fee(fee);
            }
        }
        *bootstrapped = true;
    }

    let best = client.call("getbestblockhash", json!([])).await?;
    let best = best.as_str().ok_or("getbestblockhash: non-string reply")?;
    if best == last_hash.as_str() {
        return Ok(());
    }

    let header = client
        .call("getblockheader", json!([best, true]))
        .await?;
    let height = header
        .get("height")
        .and_then(Value::as_i64)
        .ok_or("getblockheader: missing height")?;
    let header_hex = client
        .call("getblockheader", json!([best, false]))
        .await?;
    let header_hex = header_hex
        .as_str()
        .ok_or("getblockheader: non-string hex reply")?;

    *last_hash = best.to_string();
    let previous = tip.tip().0;
    tip.set_tip(height, header_hex);
    // Height must move forward for notification purposes; a reorg to the
    // same height re-announces at the new tip's height anyway.
    if height >= previous {
        controller.registry.notify_tip(height, header_hex);
        // Every subscribed scripthash gets a recompute pass; sessions compare
        // status hashes and only notify clients whose status actually moved.
        for hash in controller.subs.all_hashes() {
            controller.notify_scripthash_change(hash, height);
        }
        log_info!("upstream tip {height} {best}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tip_state_round_trip() {
        let tip = TipState::default();
        assert_eq!(tip.tip(), (-1, String::new()));
        tip.set_tip(100, "aabb");
        assert_eq!(tip.tip(), (100, "aabb".to_string()));
        tip.set_genesis_hash("00aa");
        assert_eq!(tip.genesis_hash(), "00aa");
        assert!((tip.relay_fee() - 1e-5).abs() < 1e-12);
        tip.set_relay_fee(0.0002);
        assert!((tip.relay_fee() - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn throttle_gate_hysteresis() {
        let gate = ThrottleGate::new(ThrottleParams {
            hi: 3,
            lo: 1,
            decay: 1,
        });
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        // Saturated at hi.
        assert!(!gate.try_acquire());
        gate.release();
        // Still closed: must decay below lo first.
        assert!(!gate.try_acquire());
        gate.release();
        gate.release();
        assert!(gate.try_acquire());
    }

    #[test]
    fn http_body_extraction() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"ok\":true}";
        assert_eq!(http_body(raw).unwrap(), b"{\"ok\":true}");
        let raw = b"HTTP/1.1 401 Unauthorized\r\n\r\nnope";
        assert!(http_body(raw).unwrap_err().contains("401"));
        assert!(http_body(b"garbage").is_err());
    }
}
