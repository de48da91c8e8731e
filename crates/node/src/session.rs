use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::dispatch;
use crate::index::IndexQuery;
use crate::options::{Options, Transport};
use crate::pool::WorkerPool;
use crate::stats::NetTotals;
use crate::subs::{ScriptHash, SubscriptionRegistry};
use crate::upstream::TipState;
use crate::util::{hex_decode, hex_encode};

pub const PROTOCOL_VERSION_MIN: &str = "1.4";
pub const PROTOCOL_VERSION_MAX: &str = "1.4.5";

const JSONRPC_PARSE_ERROR: i64 = -32700;
const JSONRPC_INVALID_REQUEST: i64 = -32600;
const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
const JSONRPC_INVALID_PARAMS: i64 = -32602;
const JSONRPC_INTERNAL_ERROR: i64 = -32603;
const JSONRPC_EXCESSIVE_RESOURCE_USAGE: i64 = -32000;

const READ_CHUNK: usize = 8192;
// A session is torn down after this many malformed requests in a row.
const MAX_PARSE_ERRORS: u32 = 10;

/// Messages delivered to a session's inbox from any thread. Delivery is
/// best-effort: once the session drops its receiver, sends fail silently and
/// late work-item results are discarded.
#[derive(Debug)]
pub enum SessionMsg {
    /// A worker-pool job finished; `line` is the fully rendered reply for
    /// request sequence `seq`. `sub` records a subscription status to retain.
    WorkDone {
        seq: u64,
        line: String,
        sub: Option<(ScriptHash, Option<String>)>,
    },
    /// A recomputed status for a subscribed scripthash, tagged with the block
    /// height it was computed at.
    NotifyStatus {
        hash: ScriptHash,
        status: Option<String>,
        height: i64,
    },
    /// The upstream tip moved.
    TipChanged { height: i64, header_hex: String },
    /// A subscribed scripthash may have changed; recompute off-thread.
    ScriptHashChange { hash: ScriptHash, height: i64 },
    /// Administrative disconnect or process shutdown.
    Close,
}

/// State shared between a session task, the registry and in-flight pool jobs.
#[derive(Debug)]
pub struct SessionShared {
    pub id: u64,
    pub addr: SocketAddr,
    pub transport: Transport,
    pub connected_ms: u64,
    pub bytes_recv: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub requests: AtomicU64,
    /// Set when the session enters Closing; pool jobs tagged with this gate
    /// skip their work and drop their results.
    pub closing: AtomicBool,
    pub tx: UnboundedSender<SessionMsg>,
}

#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub id: u64,
    pub addr: SocketAddr,
    pub transport: Transport,
    pub connected_ms: u64,
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub requests: u64,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<u64, Arc<SessionShared>>,
    per_ip: HashMap<IpAddr, usize>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdmissionError {
    PerIpLimit,
}

/// Live-session table. Admission (the per-IP cap) and registration happen
/// under one lock so concurrent accepts cannot overshoot the cap.
#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn register(
        &self,
        addr: SocketAddr,
        transport: Transport,
        tx: UnboundedSender<SessionMsg>,
        max_clients_per_ip: usize,
        exempt: bool,
    ) -> Result<Arc<SessionShared>, AdmissionError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if max_clients_per_ip > 0 && !exempt {
            let current = inner.per_ip.get(&addr.ip()).copied().unwrap_or(0);
            if current >= max_clients_per_ip {
                return Err(AdmissionError::PerIpLimit);
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SessionShared {
            id,
            addr,
            transport,
            connected_ms: crate::logging::now_ms(),
            bytes_recv: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            tx,
        });
        inner.sessions.insert(id, Arc::clone(&shared));
        *inner.per_ip.entry(addr.ip()).or_insert(0) += 1;
        Ok(shared)
    }

    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(shared) = inner.sessions.remove(&id) {
            shared.closing.store(true, Ordering::Release);
            let ip = shared.addr.ip();
            if let Some(count) = inner.per_ip.get_mut(&ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.per_ip.remove(&ip);
                }
            }
        }
    }

    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.sessions.len())
            .unwrap_or(0)
    }

    pub fn ip_count(&self, ip: &IpAddr) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.per_ip.get(ip).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return Vec::new(),
        };
        inner
            .sessions
            .values()
            .map(|shared| SessionSnapshot {
                id: shared.id,
                addr: shared.addr,
                transport: shared.transport,
                connected_ms: shared.connected_ms,
                bytes_recv: shared.bytes_recv.load(Ordering::Relaxed),
                bytes_sent: shared.bytes_sent.load(Ordering::Relaxed),
                requests: shared.requests.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Ask every live session to close (shutdown step 4).
    pub fn close_all(&self) {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        for shared in inner.sessions.values() {
            shared.closing.store(true, Ordering::Release);
            let _ = shared.tx.send(SessionMsg::Close);
        }
    }

    pub fn notify_tip(&self, height: i64, header_hex: &str) {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        for shared in inner.sessions.values() {
            let _ = shared.tx.send(SessionMsg::TipChanged {
                height,
                header_hex: header_hex.to_string(),
            });
        }
    }

    pub fn notify_scripthash(&self, targets: &[u64], hash: ScriptHash, height: i64) {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        for id in targets {
            if let Some(shared) = inner.sessions.get(id) {
                let _ = shared.tx.send(SessionMsg::ScriptHashChange { hash, height });
            }
        }
    }
}

/// Everything a session needs, shared read-only across all of them.
pub struct SessionContext {
    pub options: Arc<Options>,
    pub registry: Arc<SessionRegistry>,
    pub subs: Arc<SubscriptionRegistry>,
    pub pool: Arc<WorkerPool>,
    pub index: Arc<dyn IndexQuery>,
    pub net_totals: Arc<NetTotals>,
    pub tip: Arc<TipState>,
    pub controller: dispatch::Handle,
    pub shutdown_request: watch::Sender<bool>,
}

/// Per-connection protocol state machine, transport-agnostic. The owning
/// task feeds it request lines and inbox messages and drains rendered reply
/// lines; replies always leave in request order even when pool work finishes
/// out of order.
pub struct SessionCore {
    ctx: Arc<SessionContext>,
    pub shared: Arc<SessionShared>,
    exempt: bool,
    next_seq: u64,
    emit_next: u64,
    pending: BTreeMap<u64, Option<String>>,
    ready: Vec<String>,
    queued_out_bytes: usize,
    status_hashes: HashMap<ScriptHash, Option<String>>,
    headers_sub_height: Option<i64>,
    last_notified_height: i64,
    parse_errors: u32,
    close_reason: Option<String>,
}

impl SessionCore {
    pub fn new(ctx: Arc<SessionContext>, shared: Arc<SessionShared>) -> Self {
        let exempt = ctx
            .options
            .is_ip_exempt_from_per_ip_limits(&shared.addr.ip());
        Self {
            ctx,
            shared,
            exempt,
            next_seq: 0,
            emit_next: 0,
            pending: BTreeMap::new(),
            ready: Vec::new(),
            queued_out_bytes: 0,
            status_hashes: HashMap::new(),
            headers_sub_height: None,
            last_notified_height: i64::MIN,
            parse_errors: 0,
            close_reason: None,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.close_reason.is_some()
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn max_buffer(&self) -> usize {
        self.ctx.options.max_buffer()
    }

    fn begin_close(&mut self, reason: impl Into<String>) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason.into());
            self.shared.closing.store(true, Ordering::Release);
        }
    }

    fn response_line(id: &Value, result: Value) -> String {
        json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
    }

    fn error_line(id: &Value, code: i64, message: &str) -> String {
        json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            .to_string()
    }

    fn queue_line(&mut self, seq: Option<u64>, line: String) {
        self.queued_out_bytes = self.queued_out_bytes.saturating_add(line.len() + 1);
        if self.queued_out_bytes > self.max_buffer() {
            self.begin_close("outbound buffer overflow");
            return;
        }
        match seq {
            Some(seq) => {
                self.pending.insert(seq, Some(line));
            }
            None => self.ready.push(line),
        }
        self.pump_pending();
    }

    // Move fully-sequenced replies from `pending` into `ready`.
    fn pump_pending(&mut self) {
        while let Some(slot) = self.pending.get(&self.emit_next) {
            if slot.is_none() {
                break;
            }
            if let Some(Some(line)) = self.pending.remove(&self.emit_next) {
                self.ready.push(line);
            }
            self.emit_next += 1;
        }
    }

    /// Drain reply lines ready to go out, oldest first.
    pub fn take_replies(&mut self) -> Vec<String> {
        let out = std::mem::take(&mut self.ready);
        let drained: usize = out.iter().map(|line| line.len() + 1).sum();
        self.queued_out_bytes = self.queued_out_bytes.saturating_sub(drained);
        out
    }

    /// One request line off the wire (one WS text frame, or one newline-
    /// terminated line on stream transports).
    pub fn on_request_line(&mut self, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        self.shared.requests.fetch_add(1, Ordering::Relaxed);
        let parsed: Result<Value, _> = serde_json::from_str(raw);
        let request = match parsed {
            Ok(value) => value,
            Err(_) => {
                self.parse_errors += 1;
                if self.parse_errors >= MAX_PARSE_ERRORS {
                    self.begin_close("too many malformed requests");
                }
                self.queue_line(
                    None,
                    Self::error_line(&Value::Null, JSONRPC_PARSE_ERROR, "invalid JSON"),
                );
                return;
            }
        };
        self.parse_errors = 0;
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            self.queue_line(
                None,
                Self::error_line(&id, JSONRPC_INVALID_REQUEST, "missing method"),
            );
            return;
        };
        let params = match request.get("params") {
            None => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                self.queue_line(
                    None,
                    Self::error_line(&id, JSONRPC_INVALID_PARAMS, "params must be an array"),
                );
                return;
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq, None);

        let method = method.to_string();
        if self.shared.transport == Transport::Admin {
            self.dispatch_admin(seq, id, &method, &params);
        } else {
            self.dispatch_public(seq, id, &method, &params);
        }
    }

    fn finish(&mut self, seq: u64, line: String) {
        self.queue_line(Some(seq), line);
    }

    fn finish_result(&mut self, seq: u64, id: &Value, result: Value) {
        self.finish(seq, Self::response_line(id, result));
    }

    fn finish_error(&mut self, seq: u64, id: &Value, code: i64, message: &str) {
        self.finish(seq, Self::error_line(id, code, message));
    }

    fn dispatch_public(&mut self, seq: u64, id: Value, method: &str, params: &[Value]) {
        match method {
            "server.ping" => self.finish_result(seq, &id, Value::Null),
            "server.version" => {
                let result = json!([
                    format!("lanternd {}", env!("CARGO_PKG_VERSION")),
                    [PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX],
                ]);
                self.finish_result(seq, &id, result);
            }
            "server.banner" => {
                let banner = self.server_banner();
                self.finish_result(seq, &id, Value::String(banner));
            }
            "server.donation_address" => {
                let addr = &self.ctx.options.donation_address;
                let result = if addr.is_empty() {
                    Value::Null
                } else {
                    Value::String(addr.clone())
                };
                self.finish_result(seq, &id, result);
            }
            "server.features" => {
                let result = self.server_features();
                self.finish_result(seq, &id, result);
            }
            "server.peers.subscribe" => self.finish_result(seq, &id, json!([])),
            "blockchain.relayfee" => {
                self.finish_result(seq, &id, json!(self.ctx.tip.relay_fee()));
            }
            "blockchain.headers.subscribe" => {
                let (height, header_hex) = self.ctx.tip.tip();
                self.headers_sub_height = Some(height);
                self.finish_result(seq, &id, json!({"height": height, "hex": header_hex}));
            }
            "blockchain.scripthash.subscribe" => self.scripthash_subscribe(seq, id, params),
            "blockchain.scripthash.unsubscribe" => {
                match parse_scripthash(params.first()) {
                    Ok(hash) => {
                        let in_registry = self.ctx.subs.unsubscribe(self.shared.id, &hash);
                        let in_session = self.status_hashes.remove(&hash).is_some();
                        self.finish_result(seq, &id, Value::Bool(in_registry || in_session));
                    }
                    Err(msg) => self.finish_error(seq, &id, JSONRPC_INVALID_PARAMS, msg),
                }
            }
            "blockchain.scripthash.get_history" => {
                self.submit_index_job(seq, id, params, IndexJob::History)
            }
            "blockchain.scripthash.get_balance" => {
                self.submit_index_job(seq, id, params, IndexJob::Balance)
            }
            "blockchain.scripthash.listunspent" => {
                self.submit_index_job(seq, id, params, IndexJob::Unspent)
            }
            _ => self.finish_error(
                seq,
                &id,
                JSONRPC_METHOD_NOT_FOUND,
                &format!("unknown method {method}"),
            ),
        }
    }

    fn dispatch_admin(&mut self, seq: u64, id: Value, method: &str, params: &[Value]) {
        match method {
            "ping" => self.finish_result(seq, &id, Value::Null),
            "getinfo" => {
                let result = json!({
                    "version": format!("lanternd {}", env!("CARGO_PKG_VERSION")),
                    "uptime": crate::logging::uptime_secs(),
                    "clients": self.ctx.registry.count(),
                    "subscriptions": self.ctx.subs.total(),
                    "height": self.ctx.tip.tip().0,
                    "extant_jobs": self.ctx.pool.extant_jobs(),
                });
                self.finish_result(seq, &id, result);
            }
            "clients" => {
                let list: Vec<Value> = self
                    .ctx
                    .registry
                    .snapshot()
                    .into_iter()
                    .map(|s| {
                        json!({
                            "id": s.id,
                            "addr": s.addr.to_string(),
                            "transport": s.transport.as_str(),
                            "connected_secs": (crate::logging::now_ms().saturating_sub(s.connected_ms)) / 1000,
                            "bytes_recv": s.bytes_recv,
                            "bytes_sent": s.bytes_sent,
                            "requests": s.requests,
                        })
                    })
                    .collect();
                self.finish_result(seq, &id, Value::Array(list));
            }
            "maxbuffer" => match params.first().and_then(Value::as_i64) {
                Some(value) if Options::is_max_buffer_in_bounds(value) => {
                    let options = Arc::clone(&self.ctx.options);
                    // Applied on the controller thread so setting changes keep
                    // a single serialized order.
                    self.ctx.controller.post(move || {
                        options.set_max_buffer(value);
                        log_info!("max_buffer set to {value}");
                    });
                    self.finish_result(seq, &id, json!(value));
                }
                _ => self.finish_error(
                    seq,
                    &id,
                    JSONRPC_INVALID_PARAMS,
                    "maxbuffer: expected an integer within the documented bounds",
                ),
            },
            "stop" => {
                let _ = self.ctx.shutdown_request.send(true);
                self.finish_result(seq, &id, Value::String("lanternd shutting down".into()));
            }
            _ => self.finish_error(
                seq,
                &id,
                JSONRPC_METHOD_NOT_FOUND,
                &format!("unknown method {method}"),
            ),
        }
    }

    fn server_banner(&self) -> String {
        if let Some(path) = &self.ctx.options.banner_file {
            if let Ok(contents) = std::fs::read_to_string(path) {
                return contents;
            }
        }
        format!("Welcome to lanternd {}", env!("CARGO_PKG_VERSION"))
    }

    fn server_features(&self) -> Value {
        let options = &self.ctx.options;
        let mut hosts = serde_json::Map::new();
        if let Some(name) = &options.hostname {
            let mut ports = serde_json::Map::new();
            if let Some(port) = options.public_tcp_port {
                ports.insert("tcp_port".into(), json!(port));
            }
            if let Some(port) = options.public_ssl_port {
                ports.insert("ssl_port".into(), json!(port));
            }
            if let Some(port) = options.public_ws_port {
                ports.insert("ws_port".into(), json!(port));
            }
            if let Some(port) = options.public_wss_port {
                ports.insert("wss_port".into(), json!(port));
            }
            hosts.insert(name.clone(), Value::Object(ports));
        }
        json!({
            "genesis_hash": self.ctx.tip.genesis_hash(),
            "hash_function": "sha256",
            "hosts": hosts,
            "protocol_min": PROTOCOL_VERSION_MIN,
            "protocol_max": PROTOCOL_VERSION_MAX,
            "pruning": Value::Null,
            "server_version": format!("lanternd {}", env!("CARGO_PKG_VERSION")),
        })
    }

    fn scripthash_subscribe(&mut self, seq: u64, id: Value, params: &[Value]) {
        let hash = match parse_scripthash(params.first()) {
            Ok(hash) => hash,
            Err(msg) => return self.finish_error(seq, &id, JSONRPC_INVALID_PARAMS, msg),
        };
        // Quota check happens at request time; the status computation is
        // pool work.
        if let Err(err) =
            self.ctx
                .subs
                .subscribe(self.shared.id, self.shared.addr.ip(), hash, self.exempt)
        {
            return self.finish_error(seq, &id, JSONRPC_EXCESSIVE_RESOURCE_USAGE, err.message());
        }
        self.submit_status_job(seq, id, hash);
    }

    fn submit_status_job(&mut self, seq: u64, id: Value, hash: ScriptHash) {
        let index = Arc::clone(&self.ctx.index);
        let shared = Arc::clone(&self.shared);
        let reject_id = id.clone();
        let accepted = self.ctx.pool.submit(Box::new(move || {
            if shared.closing.load(Ordering::Acquire) {
                return;
            }
            let line = match index.scripthash_status(&hash) {
                Ok(status) => {
                    let result = status
                        .clone()
                        .map(Value::String)
                        .unwrap_or(Value::Null);
                    let line = SessionCore::response_line(&id, result);
                    let _ = shared.tx.send(SessionMsg::WorkDone {
                        seq,
                        line,
                        sub: Some((hash, status)),
                    });
                    return;
                }
                Err(err) => SessionCore::error_line(&id, JSONRPC_INTERNAL_ERROR, &err),
            };
            let _ = shared.tx.send(SessionMsg::WorkDone {
                seq,
                line,
                sub: None,
            });
        }));
        if !accepted {
            self.finish_error(
                seq,
                &reject_id,
                JSONRPC_EXCESSIVE_RESOURCE_USAGE,
                "server is busy, try again later",
            );
        }
    }

    fn submit_index_job(&mut self, seq: u64, id: Value, params: &[Value], job: IndexJob) {
        let hash = match parse_scripthash(params.first()) {
            Ok(hash) => hash,
            Err(msg) => return self.finish_error(seq, &id, JSONRPC_INVALID_PARAMS, msg),
        };
        let index = Arc::clone(&self.ctx.index);
        let shared = Arc::clone(&self.shared);
        let max_history = self.ctx.options.max_history;
        let reject_id = id.clone();
        let accepted = self.ctx.pool.submit(Box::new(move || {
            if shared.closing.load(Ordering::Acquire) {
                return;
            }
            let outcome: Result<Value, String> = match job {
                IndexJob::History => index.scripthash_history(&hash, max_history).map(|items| {
                    Value::Array(
                        items
                            .into_iter()
                            .map(|item| json!({"height": item.height, "tx_hash": item.tx_hash}))
                            .collect(),
                    )
                }),
                IndexJob::Balance => index.scripthash_balance(&hash).map(|(confirmed, mempool)| {
                    json!({"confirmed": confirmed, "unconfirmed": mempool})
                }),
                IndexJob::Unspent => index.scripthash_unspent(&hash).map(|items| {
                    Value::Array(
                        items
                            .into_iter()
                            .map(|item| {
                                json!({
                                    "height": item.height,
                                    "tx_hash": item.tx_hash,
                                    "tx_pos": item.tx_pos,
                                    "value": item.value,
                                })
                            })
                            .collect(),
                    )
                }),
            };
            let line = match outcome {
                Ok(result) => SessionCore::response_line(&id, result),
                Err(err) if err.contains("history too large") => {
                    SessionCore::error_line(&id, JSONRPC_EXCESSIVE_RESOURCE_USAGE, &err)
                }
                Err(err) => SessionCore::error_line(&id, JSONRPC_INTERNAL_ERROR, &err),
            };
            let _ = shared.tx.send(SessionMsg::WorkDone {
                seq,
                line,
                sub: None,
            });
        }));
        if !accepted {
            self.finish_error(
                seq,
                &reject_id,
                JSONRPC_EXCESSIVE_RESOURCE_USAGE,
                "server is busy, try again later",
            );
        }
    }

    pub fn on_msg(&mut self, msg: SessionMsg) {
        match msg {
            SessionMsg::WorkDone { seq, line, sub } => {
                if let Some((hash, status)) = sub {
                    self.status_hashes.insert(hash, status);
                }
                self.finish(seq, line);
            }
            SessionMsg::TipChanged { height, header_hex } => {
                if let Some(last) = self.headers_sub_height {
                    // Tip notifications are strictly monotonic in height.
                    if height > last {
                        self.headers_sub_height = Some(height);
                        let line = json!({
                            "jsonrpc": "2.0",
                            "method": "blockchain.headers.subscribe",
                            "params": [{"height": height, "hex": header_hex}],
                        })
                        .to_string();
                        self.queue_line(None, line);
                    }
                }
            }
            SessionMsg::ScriptHashChange { hash, height } => {
                if !self.status_hashes.contains_key(&hash) {
                    return;
                }
                let index = Arc::clone(&self.ctx.index);
                let shared = Arc::clone(&self.shared);
                let _ = self.ctx.pool.submit(Box::new(move || {
                    if shared.closing.load(Ordering::Acquire) {
                        return;
                    }
                    if let Ok(status) = index.scripthash_status(&hash) {
                        let _ = shared.tx.send(SessionMsg::NotifyStatus {
                            hash,
                            status,
                            height,
                        });
                    }
                }));
            }
            SessionMsg::NotifyStatus {
                hash,
                status,
                height,
            } => {
                if height < self.last_notified_height {
                    return;
                }
                let Some(old) = self.status_hashes.get(&hash) else {
                    return;
                };
                if *old == status {
                    return;
                }
                self.last_notified_height = height;
                self.status_hashes.insert(hash, status.clone());
                let line = json!({
                    "jsonrpc": "2.0",
                    "method": "blockchain.scripthash.subscribe",
                    "params": [
                        hex_encode(&hash),
                        status.map(Value::String).unwrap_or(Value::Null),
                    ],
                })
                .to_string();
                self.queue_line(None, line);
            }
            SessionMsg::Close => self.begin_close("administrative disconnect"),
        }
    }

    /// Tear-down bookkeeping: drop the registry entry and sweep the
    /// subscription table.
    pub fn cleanup(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        let swept = self.ctx.subs.remove_session(self.shared.id);
        self.ctx.registry.remove(self.shared.id);
        if swept > 0 {
            log_debug!(
                "session {} swept {} {}",
                self.shared.id,
                swept,
                crate::util::pluralize("subscription", swept as i64)
            );
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum IndexJob {
    History,
    Balance,
    Unspent,
}

fn parse_scripthash(param: Option<&Value>) -> Result<ScriptHash, &'static str> {
    let raw = param
        .and_then(Value::as_str)
        .ok_or("missing or non-string scripthash")?;
    let bytes = hex_decode(raw).ok_or("non-hex scripthash")?;
    let hash: ScriptHash = bytes
        .try_into()
        .map_err(|_| "scripthash must be 32 bytes")?;
    Ok(hash)
}

/// Drive a newline-delimited JSON session over any byte stream (plain TCP,
/// TLS, or the admin transport).
pub async fn run_line_session<S>(
    stream: S,
    core: &mut SessionCore,
    mut rx: UnboundedReceiver<SessionMsg>,
) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut inbuf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        for line in core.take_replies() {
            let bytes = line.into_bytes();
            wr.write_all(&bytes)
                .await
                .map_err(|err| format!("write failed: {err}"))?;
            wr.write_all(b"\n")
                .await
                .map_err(|err| format!("write failed: {err}"))?;
            let sent = bytes.len() + 1;
            core.shared.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
            core.ctx.net_totals.add_sent(sent);
        }
        if core.is_closing() {
            let _ = wr.shutdown().await;
            return Ok(());
        }

        tokio::select! {
            read = rd.read(&mut chunk) => {
                let n = read.map_err(|err| format!("read failed: {err}"))?;
                if n == 0 {
                    return Ok(());
                }
                core.shared.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
                core.ctx.net_totals.add_recv(n);
                inbuf.extend_from_slice(&chunk[..n]);
                if inbuf.len() > core.max_buffer() {
                    return Err("read buffer exceeded max_buffer".to_string());
                }
                while let Some(pos) = inbuf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = inbuf.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                    core.on_request_line(&text);
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(msg) => core.on_msg(msg),
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Drive an Electrum session over WebSocket text frames (one request per
/// frame, one reply per frame).
pub async fn run_ws_session<S>(
    mut ws: WebSocketStream<S>,
    core: &mut SessionCore,
    mut rx: UnboundedReceiver<SessionMsg>,
) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        for line in core.take_replies() {
            let sent = line.len();
            ws.send(Message::Text(line.into()))
                .await
                .map_err(|err| format!("ws send failed: {err}"))?;
            core.shared.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
            core.ctx.net_totals.add_sent(sent);
        }
        if core.is_closing() {
            let _ = ws.close(None).await;
            return Ok(());
        }

        tokio::select! {
            frame = ws.next() => {
                match frame {
                    None => return Ok(()),
                    Some(Err(err)) => return Err(format!("ws read failed: {err}")),
                    Some(Ok(Message::Text(text))) => {
                        let n = text.len();
                        core.shared.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
                        core.ctx.net_totals.add_recv(n);
                        if n > core.max_buffer() {
                            return Err("request frame exceeded max_buffer".to_string());
                        }
                        core.on_request_line(&text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => {}
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(msg) => core.on_msg(msg),
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{HistoryItem, MemIndex};
    use crate::options::Options;

    fn test_ctx(max_subs: usize) -> Arc<SessionContext> {
        let options = Arc::new(Options::test_default());
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let controller = dispatch::EventLoop::new("test-controller");
        let handle = controller.handle();
        Arc::new(SessionContext {
            options,
            registry: Arc::new(SessionRegistry::default()),
            subs: Arc::new(SubscriptionRegistry::new(max_subs, max_subs)),
            pool: WorkerPool::new(1, 100),
            index: Arc::new(MemIndex::new()),
            net_totals: Arc::new(NetTotals::default()),
            tip: Arc::new(TipState::default()),
            controller: handle,
            shutdown_request: shutdown_tx,
        })
    }

    fn test_session(
        ctx: &Arc<SessionContext>,
        transport: Transport,
    ) -> (SessionCore, UnboundedReceiver<SessionMsg>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = ctx
            .registry
            .register("1.2.3.4:5555".parse().unwrap(), transport, tx, 0, false)
            .expect("register");
        (SessionCore::new(Arc::clone(ctx), shared), rx)
    }

    fn fixture_hash(tag: u8) -> ScriptHash {
        let mut hash = [0u8; 32];
        hash[0] = tag;
        hash
    }

    fn single_reply(core: &mut SessionCore) -> Value {
        let mut replies = core.take_replies();
        assert_eq!(replies.len(), 1, "{replies:?}");
        serde_json::from_str(&replies.pop().expect("reply")).expect("valid JSON reply")
    }

    #[test]
    fn ping_is_answered_locally() {
        let ctx = test_ctx(100);
        let (mut core, _rx) = test_session(&ctx, Transport::Tcp);
        core.on_request_line(r#"{"id": 7, "method": "server.ping", "params": []}"#);
        let reply = single_reply(&mut core);
        assert_eq!(reply["id"], json!(7));
        assert_eq!(reply["result"], Value::Null);
    }

    #[test]
    fn unknown_method_yields_error() {
        let ctx = test_ctx(100);
        let (mut core, _rx) = test_session(&ctx, Transport::Tcp);
        core.on_request_line(r#"{"id": 1, "method": "blockchain.nope"}"#);
        let reply = single_reply(&mut core);
        assert_eq!(reply["error"]["code"], json!(JSONRPC_METHOD_NOT_FOUND));
    }

    #[test]
    fn malformed_json_yields_parse_error_reply() {
        let ctx = test_ctx(100);
        let (mut core, _rx) = test_session(&ctx, Transport::Tcp);
        core.on_request_line("{nope");
        let reply = single_reply(&mut core);
        assert_eq!(reply["error"]["code"], json!(JSONRPC_PARSE_ERROR));
        assert!(!core.is_closing());
    }

    #[test]
    fn repeated_garbage_closes_the_session() {
        let ctx = test_ctx(100);
        let (mut core, _rx) = test_session(&ctx, Transport::Tcp);
        for _ in 0..MAX_PARSE_ERRORS {
            core.on_request_line("{nope");
        }
        assert!(core.is_closing());
    }

    #[test]
    fn replies_are_emitted_in_request_order() {
        let ctx = test_ctx(100);
        let (mut core, mut rx) = test_session(&ctx, Transport::Tcp);
        // Request 0 goes to the pool (stays pending), request 1 is local.
        let sh = hex_encode(&fixture_hash(1));
        core.on_request_line(&format!(
            r#"{{"id": 0, "method": "blockchain.scripthash.get_history", "params": ["{sh}"]}}"#
        ));
        core.on_request_line(r#"{"id": 1, "method": "server.ping"}"#);
        assert!(core.take_replies().is_empty(), "local reply must wait");

        // Run the pool job and deliver its completion.
        ctx.pool.start();
        let msg = rx.blocking_recv().expect("work done");
        core.on_msg(msg);
        let replies = core.take_replies();
        assert_eq!(replies.len(), 2);
        let first: Value = serde_json::from_str(&replies[0]).unwrap();
        let second: Value = serde_json::from_str(&replies[1]).unwrap();
        assert_eq!(first["id"], json!(0));
        assert_eq!(second["id"], json!(1));
    }

    #[test]
    fn subscription_quota_breach_is_reported_and_not_recorded() {
        let ctx = test_ctx(100);
        // Registry allowing a single per-IP subscription.
        let ctx = Arc::new(SessionContext {
            subs: Arc::new(SubscriptionRegistry::new(100, 1)),
            options: Arc::clone(&ctx.options),
            registry: Arc::clone(&ctx.registry),
            pool: Arc::clone(&ctx.pool),
            index: Arc::clone(&ctx.index),
            net_totals: Arc::clone(&ctx.net_totals),
            tip: Arc::clone(&ctx.tip),
            controller: ctx.controller.clone(),
            shutdown_request: ctx.shutdown_request.clone(),
        });
        let (mut core, mut rx) = test_session(&ctx, Transport::Tcp);
        ctx.pool.start();
        let sh1 = hex_encode(&fixture_hash(1));
        let sh2 = hex_encode(&fixture_hash(2));
        core.on_request_line(&format!(
            r#"{{"id": 1, "method": "blockchain.scripthash.subscribe", "params": ["{sh1}"]}}"#
        ));
        let msg = rx.blocking_recv().expect("status job");
        core.on_msg(msg);
        let reply = single_reply(&mut core);
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["result"], Value::Null); // empty index -> null status

        core.on_request_line(&format!(
            r#"{{"id": 2, "method": "blockchain.scripthash.subscribe", "params": ["{sh2}"]}}"#
        ));
        let reply = single_reply(&mut core);
        assert_eq!(
            reply["error"]["code"],
            json!(JSONRPC_EXCESSIVE_RESOURCE_USAGE)
        );
        assert_eq!(ctx.subs.session_subs(core.shared.id), 1);
        assert!(!core.is_closing(), "quota breach must not close the session");
    }

    #[test]
    fn tip_notifications_are_monotonic() {
        let ctx = test_ctx(100);
        let (mut core, _rx) = test_session(&ctx, Transport::Tcp);
        core.on_request_line(r#"{"id": 1, "method": "blockchain.headers.subscribe"}"#);
        let _ = core.take_replies();
        core.on_msg(SessionMsg::TipChanged {
            height: 10,
            header_hex: "aa".into(),
        });
        core.on_msg(SessionMsg::TipChanged {
            height: 9,
            header_hex: "bb".into(),
        });
        core.on_msg(SessionMsg::TipChanged {
            height: 11,
            header_hex: "cc".into(),
        });
        let replies = core.take_replies();
        assert_eq!(replies.len(), 2);
        let first: Value = serde_json::from_str(&replies[0]).unwrap();
        let last: Value = serde_json::from_str(&replies[1]).unwrap();
        assert_eq!(first["params"][0]["height"], json!(10));
        assert_eq!(last["params"][0]["height"], json!(11));
    }

    #[test]
    fn scripthash_notification_requires_subscription_and_changed_status() {
        let ctx = test_ctx(100);
        let index = Arc::new(MemIndex::new());
        let ctx = Arc::new(SessionContext {
            index: index.clone() as Arc<dyn IndexQuery>,
            options: Arc::clone(&ctx.options),
            registry: Arc::clone(&ctx.registry),
            subs: Arc::clone(&ctx.subs),
            pool: Arc::clone(&ctx.pool),
            net_totals: Arc::clone(&ctx.net_totals),
            tip: Arc::clone(&ctx.tip),
            controller: ctx.controller.clone(),
            shutdown_request: ctx.shutdown_request.clone(),
        });
        let (mut core, mut rx) = test_session(&ctx, Transport::Tcp);
        ctx.pool.start();
        let hash = fixture_hash(7);
        let sh = hex_encode(&hash);
        core.on_request_line(&format!(
            r#"{{"id": 1, "method": "blockchain.scripthash.subscribe", "params": ["{sh}"]}}"#
        ));
        core.on_msg(rx.blocking_recv().expect("status"));
        let _ = core.take_replies();

        // Unsubscribed hash: change is ignored outright.
        core.on_msg(SessionMsg::ScriptHashChange {
            hash: fixture_hash(8),
            height: 5,
        });
        assert!(core.take_replies().is_empty());

        // Subscribed hash with new history: notification goes out.
        index.push_history(
            hash,
            HistoryItem {
                height: 100,
                tx_hash: "dd".repeat(32),
            },
        );
        core.on_msg(SessionMsg::ScriptHashChange { hash, height: 100 });
        core.on_msg(rx.blocking_recv().expect("notify status"));
        let replies = core.take_replies();
        assert_eq!(replies.len(), 1);
        let notify: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(notify["method"], json!("blockchain.scripthash.subscribe"));
        assert_eq!(notify["params"][0], json!(sh));
        assert!(notify["params"][1].is_string());

        // Same status again: no duplicate notification.
        core.on_msg(SessionMsg::ScriptHashChange { hash, height: 101 });
        core.on_msg(rx.blocking_recv().expect("notify status"));
        assert!(core.take_replies().is_empty());
    }

    #[test]
    fn admission_cap_counts_per_ip() {
        let registry = SessionRegistry::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let addr: SocketAddr = "9.9.9.9:1000".parse().unwrap();
        let s1 = registry
            .register(addr, Transport::Tcp, tx.clone(), 1, false)
            .expect("first");
        let err = registry
            .register(addr, Transport::Tcp, tx.clone(), 1, false)
            .unwrap_err();
        assert_eq!(err, AdmissionError::PerIpLimit);
        // Exempt IPs bypass the cap; other IPs are unaffected.
        assert!(registry
            .register(addr, Transport::Tcp, tx.clone(), 1, true)
            .is_ok());
        assert!(registry
            .register("9.9.9.8:1000".parse().unwrap(), Transport::Tcp, tx, 1, false)
            .is_ok());
        registry.remove(s1.id);
        assert_eq!(registry.ip_count(&addr.ip()), 1);
    }

    #[test]
    fn admin_methods_are_not_reachable_on_public_transports() {
        let ctx = test_ctx(100);
        let (mut core, _rx) = test_session(&ctx, Transport::Tcp);
        core.on_request_line(r#"{"id": 1, "method": "stop"}"#);
        let reply = single_reply(&mut core);
        assert_eq!(reply["error"]["code"], json!(JSONRPC_METHOD_NOT_FOUND));
    }

    #[test]
    fn admin_stop_requests_shutdown() {
        let ctx = test_ctx(100);
        let mut shutdown_rx = ctx.shutdown_request.subscribe();
        let (mut core, _rx) = test_session(&ctx, Transport::Admin);
        core.on_request_line(r#"{"id": 1, "method": "stop"}"#);
        let reply = single_reply(&mut core);
        assert_eq!(reply["result"], json!("lanternd shutting down"));
        assert!(*shutdown_rx.borrow_and_update());
    }

    #[test]
    fn outbound_overflow_forces_closing() {
        let ctx = test_ctx(100);
        let (mut core, _rx) = test_session(&ctx, Transport::Tcp);
        core.on_request_line(r#"{"id": 1, "method": "blockchain.headers.subscribe"}"#);
        // Do not drain; flood with notifications until the bound trips.
        let big = "ff".repeat(4096);
        let mut height = 100;
        while !core.is_closing() && height < 100_000 {
            core.on_msg(SessionMsg::TipChanged {
                height,
                header_hex: big.clone(),
            });
            height += 1;
        }
        assert!(core.is_closing());
        assert_eq!(core.close_reason(), Some("outbound buffer overflow"));
    }
}
