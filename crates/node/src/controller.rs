use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::dispatch::{EventLoop, Handle};
use crate::index::IndexQuery;
use crate::options::{Options, Transport};
use crate::pool::WorkerPool;
use crate::session::SessionRegistry;
use crate::stats::{ListenerStats, NetTotals, PollStats};
use crate::subs::SubscriptionRegistry;
use crate::upstream::TipState;
use crate::util::hex_encode;

/// Timeout for snapshot calls onto the controller thread. A missed deadline
/// degrades to a null snapshot (`[null]` on the stats endpoint), never a torn
/// read.
const SNAPSHOT_TIMEOUT_MS: u64 = 2500;

/// Owns the session registry and aggregates every counter the stats channel
/// exposes. Snapshots are built on the controller's own event-loop thread so
/// they observe a consistent view.
pub struct Controller {
    pub options: Arc<Options>,
    pub registry: Arc<SessionRegistry>,
    pub subs: Arc<SubscriptionRegistry>,
    pub pool: Arc<WorkerPool>,
    pub net_totals: Arc<NetTotals>,
    pub poll_stats: Arc<PollStats>,
    pub tip: Arc<TipState>,
    pub index: Arc<dyn IndexQuery>,
    listeners: Mutex<Vec<(Transport, SocketAddr, Arc<ListenerStats>)>>,
    handle: Mutex<Option<Handle>>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: Arc<Options>,
        registry: Arc<SessionRegistry>,
        subs: Arc<SubscriptionRegistry>,
        pool: Arc<WorkerPool>,
        net_totals: Arc<NetTotals>,
        poll_stats: Arc<PollStats>,
        tip: Arc<TipState>,
        index: Arc<dyn IndexQuery>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            registry,
            subs,
            pool,
            net_totals,
            poll_stats,
            tip,
            index,
            listeners: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        })
    }

    /// Start the controller's event-loop thread. Must be called once before
    /// any snapshot or setting-change traffic.
    pub fn start(self: &Arc<Self>) -> std::io::Result<std::thread::JoinHandle<()>> {
        let event_loop = EventLoop::new("Controller");
        let handle = event_loop.handle();
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        event_loop.spawn()
    }

    pub fn handle(&self) -> Option<Handle> {
        self.handle.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle() {
            handle.stop();
        }
    }

    /// Register a bound listener so its counters show up in snapshots.
    pub fn register_listener(&self, kind: Transport, addr: SocketAddr) -> Arc<ListenerStats> {
        let stats = Arc::new(ListenerStats::default());
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((kind, addr, Arc::clone(&stats)));
        }
        stats
    }

    /// Thread-safe stats snapshot; `None` when the controller thread cannot
    /// answer in time (renders as `[null]` over HTTP).
    pub fn stats_safe(self: &Arc<Self>) -> Option<Value> {
        self.snapshot_on_controller_thread(|this| this.build_stats())
    }

    /// Thread-safe debug snapshot filtered by stats-endpoint query params.
    pub fn debug_safe(self: &Arc<Self>, params: &HashMap<String, String>) -> Option<Value> {
        let params = params.clone();
        self.snapshot_on_controller_thread(move |this| this.build_debug(&params))
    }

    fn snapshot_on_controller_thread<F>(self: &Arc<Self>, build: F) -> Option<Value>
    where
        F: FnOnce(&Controller) -> Value + Send + 'static,
    {
        let handle = self.handle()?;
        let slot: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let this = Arc::clone(self);
        let completed = handle.call(
            move || {
                let value = build(&this);
                if let Ok(mut out) = out.lock() {
                    *out = Some(value);
                }
            },
            SNAPSHOT_TIMEOUT_MS,
        );
        if !completed {
            return None;
        }
        slot.lock().ok().and_then(|mut value| value.take())
    }

    fn build_stats(&self) -> Value {
        let mut listeners = serde_json::Map::new();
        if let Ok(list) = self.listeners.lock() {
            for (kind, addr, stats) in list.iter() {
                let snap = stats.snapshot();
                listeners.insert(
                    format!("{} {}", kind.as_str(), addr),
                    json!({
                        "accepted": snap.accepted,
                        "active": snap.active,
                        "rejected": snap.rejected,
                    }),
                );
            }
        }
        #[derive(serde::Serialize)]
        struct NetTotalsView {
            bytes_recv: u64,
            bytes_sent: u64,
            connections: usize,
        }
        #[derive(serde::Serialize)]
        struct PoolView {
            extant_jobs: usize,
            extant_limit: usize,
            threads: usize,
            max_threads: usize,
        }
        let net = self.net_totals.snapshot();
        let poll = self.poll_stats.snapshot();
        let (tip_height, _) = self.tip.tip();
        json!({
            "version": format!("lanternd {}", env!("CARGO_PKG_VERSION")),
            "uptime_secs": crate::logging::uptime_secs(),
            "clients": {
                "total": self.registry.count(),
                "listeners": Value::Object(listeners),
            },
            "net": serde_json::to_value(NetTotalsView {
                bytes_recv: net.bytes_recv,
                bytes_sent: net.bytes_sent,
                connections: net.connections,
            }).unwrap_or(Value::Null),
            "pool": serde_json::to_value(PoolView {
                extant_jobs: self.pool.extant_jobs(),
                extant_limit: self.pool.extant_job_limit(),
                threads: self.pool.active_threads(),
                max_threads: self.pool.max_thread_count(),
            }).unwrap_or(Value::Null),
            "subscriptions": {
                "total": self.subs.total(),
                "unique_scripthashes": self.subs.unique_scripthashes(),
                "max_globally": self.subs.max_globally(),
                "max_per_ip": self.subs.max_per_ip(),
            },
            "bitcoind": {
                "host": self.options.bitcoind.0.clone(),
                "port": self.options.bitcoind.1,
                "tls": self.options.bitcoind_tls,
                "polls_ok": poll.polls_ok,
                "polls_failed": poll.polls_failed,
                "last_poll_ms": poll.last_poll_ms,
                "last_poll_elapsed_ms": poll.last_poll_elapsed_ms,
                "last_poll_tip_height": poll.tip_height,
                "throttled": poll.throttled,
            },
            "tip_height": tip_height,
            "max_buffer": self.options.max_buffer(),
        })
    }

    fn build_debug(&self, params: &HashMap<String, String>) -> Value {
        let mut out = self.build_stats();
        let include = |key: &str| params.is_empty() || params.contains_key(key);
        if include("sessions") {
            let sessions: Vec<Value> = self
                .registry
                .snapshot()
                .into_iter()
                .map(|s| {
                    json!({
                        "id": s.id,
                        "addr": s.addr.to_string(),
                        "transport": s.transport.as_str(),
                        "connected_ms": s.connected_ms,
                        "bytes_recv": s.bytes_recv,
                        "bytes_sent": s.bytes_sent,
                        "requests": s.requests,
                        "subscriptions": self.subs.session_subs(s.id),
                    })
                })
                .collect();
            out["sessions"] = Value::Array(sessions);
        }
        if include("subs") {
            out["subs"] = json!({
                "total": self.subs.total(),
                "unique_scripthashes": self.subs.unique_scripthashes(),
            });
        }
        if include("options") {
            let options = &self.options;
            out["options"] = json!({
                "datadir": options.datadir.display().to_string(),
                "polltime": options.poll_interval_secs,
                "max_clients_per_ip": options.max_clients_per_ip,
                "max_history": options.max_history,
                "max_buffer": options.max_buffer(),
                "peering": options.peering,
                "announce": options.announce,
                "peering_enforce_unique_ip": options.peering_enforce_unique_ip,
                "tor_hostname": options.tor_hostname.clone(),
                "tor_banner": options
                    .tor_banner_file
                    .as_ref()
                    .map(|p| p.display().to_string()),
                "tor_tcp_port": options.tor_tcp_port,
                "tor_ssl_port": options.tor_ssl_port,
                "tor_ws_port": options.tor_ws_port,
                "tor_wss_port": options.tor_wss_port,
                "tor_proxy": options.tor_proxy.map(|a| a.to_string()),
                "tor_user": options.tor_user.clone(),
                "tor_pass": if options.tor_pass.is_empty() { "" } else { "<hidden>" },
                "cert": options.cert.as_ref().map(|c| {
                    json!({
                        "file": c.cert_file.display().to_string(),
                        "key_file": c.key_file.display().to_string(),
                        "algorithm": c.key_algorithm,
                        "chain_len": c.certs.len(),
                    })
                }),
                "db_max_open_files": options.db.max_open_files,
                "db_keep_log_file_num": options.db.keep_log_file_num,
            });
        }
        out
    }

    /// Fan a scripthash change out to every session subscribed to it,
    /// stamped with the height it was observed at.
    pub fn notify_scripthash_change(&self, hash: crate::subs::ScriptHash, height: i64) {
        let targets = self.subs.sessions_for(&hash);
        if !targets.is_empty() {
            self.registry.notify_scripthash(&targets, hash, height);
        }
    }

    /// Shutdown step 4: close every session and sweep the registry.
    pub fn close_all_sessions(&self) {
        self.registry.close_all();
    }

    /// Diagnostic `--dump-sh` support: write every indexed scripthash to
    /// `path` as a JSON array.
    pub fn dump_script_hashes(&self, path: &Path) -> Result<usize, String> {
        let hashes = self.index.all_scripthashes();
        let array: Vec<Value> = hashes
            .iter()
            .map(|hash| Value::String(hex_encode(hash)))
            .collect();
        let rendered = serde_json::to_string(&Value::Array(array))
            .map_err(|err| format!("dump-sh serialize failed: {err}"))?;
        std::fs::write(path, rendered.as_bytes())
            .map_err(|err| format!("dump-sh write to {} failed: {err}", path.display()))?;
        Ok(hashes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemIndex;

    fn test_controller() -> Arc<Controller> {
        Controller::new(
            Arc::new(Options::test_default()),
            Arc::new(SessionRegistry::default()),
            Arc::new(SubscriptionRegistry::new(1000, 100)),
            WorkerPool::new(1, 100),
            Arc::new(NetTotals::default()),
            Arc::new(PollStats::default()),
            Arc::new(TipState::default()),
            Arc::new(MemIndex::new()),
        )
    }

    #[test]
    fn stats_none_before_start_and_some_after() {
        let controller = test_controller();
        assert!(controller.stats_safe().is_none());
        let join = controller.start().expect("start");
        // The loop needs a beat to record its thread id.
        for _ in 0..100 {
            if controller.stats_safe().is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let stats = controller.stats_safe().expect("stats after start");
        assert!(stats["uptime_secs"].is_number());
        assert_eq!(stats["clients"]["total"], json!(0));
        controller.stop();
        let _ = join.join();
        assert!(controller.stats_safe().is_none());
    }

    #[test]
    fn listener_registration_shows_in_stats() {
        let controller = test_controller();
        let join = controller.start().expect("start");
        let stats = controller.register_listener(Transport::Tcp, "0.0.0.0:50001".parse().unwrap());
        stats.note_accepted();
        stats.note_rejected();
        let mut snapshot = None;
        for _ in 0..100 {
            snapshot = controller.stats_safe();
            if snapshot.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let snapshot = snapshot.expect("snapshot");
        let entry = &snapshot["clients"]["listeners"]["tcp 0.0.0.0:50001"];
        assert_eq!(entry["accepted"], json!(1));
        assert_eq!(entry["active"], json!(1));
        assert_eq!(entry["rejected"], json!(1));
        controller.stop();
        let _ = join.join();
    }

    #[test]
    fn debug_filters_by_params() {
        let controller = test_controller();
        let join = controller.start().expect("start");
        let mut params = HashMap::new();
        params.insert("subs".to_string(), "1".to_string());
        let mut debug = None;
        for _ in 0..100 {
            debug = controller.debug_safe(&params);
            if debug.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let debug = debug.expect("debug");
        assert!(debug.get("subs").is_some());
        assert!(debug.get("sessions").is_none());
        controller.stop();
        let _ = join.join();
    }
}
