use lantern_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, format_args!($($arg)*));
        }
    }};
}

macro_rules! log_fatal {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Fatal, $($arg)*);
    }};
}

macro_rules! log_critical {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Critical, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warning, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

mod controller;
mod dispatch;
mod index;
mod options;
mod pool;
mod server;
mod session;
mod stats;
mod stats_http;
mod subs;
mod upstream;
mod util;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use tokio::sync::watch;

use crate::controller::Controller;
use crate::index::MemIndex;
use crate::options::{CliAction, Options};
use crate::pool::WorkerPool;
use crate::session::{SessionContext, SessionRegistry};
use crate::stats::{NetTotals, PollStats};
use crate::subs::SubscriptionRegistry;
use crate::upstream::{TipState, UpstreamClient};
use crate::util::pluralize;

const POOL_DRAIN_TIMEOUT_MS: u64 = 5000;
const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

/// Once shutdown begins no new background work may be created; the pool and
/// the accept paths consult this flag.
static BLOCK_NEW: AtomicBool = AtomicBool::new(false);

pub fn block_new_tasks() -> bool {
    BLOCK_NEW.load(Ordering::Acquire)
}

fn main() {
    let action = match options::parse_args(std::env::args().skip(1)) {
        Ok(action) => action,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("Use the -h option to show help.");
            std::process::exit(1);
        }
    };
    match action {
        CliAction::PrintHelp => println!("{}", options::usage()),
        CliAction::PrintVersion => println!("lanternd {}", env!("CARGO_PKG_VERSION")),
        CliAction::SelfTest { tests, benches } => {
            std::process::exit(run_self_tests(&tests, &benches))
        }
        CliAction::Run(options) => std::process::exit(run(Arc::from(options))),
    }
}

fn run(options: Arc<Options>) -> i32 {
    logging::init(logging::LogConfig {
        debug: options.verbose_debug,
        trace: options.verbose_trace,
        ts_format: options.ts_format,
        syslog: options.syslog,
    });
    log_info!(
        "lanternd {} - {} - starting up ...",
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%a %b %-d, %Y %H:%M:%S%.3f")
    );
    if logging::is_clock_steady() {
        log_debug!("High resolution clock: isSteady = true");
    } else {
        log_debug!(
            "High resolution clock is not steady. Log timestamps may drift if system time gets adjusted."
        );
    }

    let lock = match lock_data_dir(&options.datadir) {
        Ok(lock) => lock,
        Err(err) => {
            log_fatal!("{err}");
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            log_fatal!("failed to start runtime: {err}");
            return 1;
        }
    };
    let code = match runtime.block_on(run_server(Arc::clone(&options))) {
        Ok(code) => code,
        Err(err) => {
            log_fatal!("{err}");
            1
        }
    };
    drop(runtime);
    drop(lock);
    log_info!("Shutdown complete");
    code
}

async fn run_server(options: Arc<Options>) -> Result<i32, String> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_code = Arc::new(AtomicI32::new(0));
    spawn_signal_handler(shutdown_tx.clone(), Arc::clone(&signal_code));

    let registry = Arc::new(SessionRegistry::default());
    let subs = Arc::new(SubscriptionRegistry::new(
        options.max_subs_globally,
        options.max_subs_per_ip,
    ));
    let pool = WorkerPool::new(0, options::DEFAULT_WORK_QUEUE);
    if !pool.set_extant_job_limit(options.work_queue) {
        return Err(format!(
            "workqueue: Unable to set workqueue to {}; set_extant_job_limit returned false.",
            options.work_queue
        ));
    }
    if options.worker_threads > 0 && !pool.set_max_thread_count(options.worker_threads) {
        return Err(format!(
            "worker_threads: Unable to set worker threads to {}",
            options.worker_threads
        ));
    }
    pool.start();
    log_debug!(
        "config: workqueue = {} worker_threads = {}",
        pool.extant_job_limit(),
        pool.max_thread_count()
    );
    let net_totals = Arc::new(NetTotals::default());
    let poll_stats = Arc::new(PollStats::default());
    let tip = Arc::new(TipState::default());
    // The on-disk index backend attaches behind this seam; until then the
    // server runs against an empty in-memory index.
    let index: Arc<dyn index::IndexQuery> = Arc::new(MemIndex::new());

    let controller = Controller::new(
        Arc::clone(&options),
        Arc::clone(&registry),
        Arc::clone(&subs),
        Arc::clone(&pool),
        Arc::clone(&net_totals),
        Arc::clone(&poll_stats),
        Arc::clone(&tip),
        Arc::clone(&index),
    );
    let controller_join = controller
        .start()
        .map_err(|err| format!("failed to start controller thread: {err}"))?;
    let controller_handle = controller
        .handle()
        .ok_or("controller handle missing after start")?;

    if options.check_db {
        let known = index.all_scripthashes().len();
        log_info!(
            "checkdb: verified {} {} in the attached index",
            known,
            pluralize("scripthash", known as i64)
        );
    }
    if let Some(path) = &options.dump_script_hashes {
        let written = controller.dump_script_hashes(path)?;
        log_info!(
            "dump-sh: wrote {} {} to {}",
            written,
            pluralize("scripthash", written as i64),
            path.display()
        );
    }

    let ctx = Arc::new(SessionContext {
        options: Arc::clone(&options),
        registry: Arc::clone(&registry),
        subs: Arc::clone(&subs),
        pool: Arc::clone(&pool),
        index: Arc::clone(&index),
        net_totals: Arc::clone(&net_totals),
        tip: Arc::clone(&tip),
        controller: controller_handle,
        shutdown_request: shutdown_tx.clone(),
    });

    // Bind everything before serving anything: a bind failure at startup is
    // fatal, not a degraded run.
    let specs = options.listeners();
    let mut bound = Vec::with_capacity(specs.len());
    for spec in specs {
        let listener = server::bind_listener(&spec, options.max_pending_connections)?;
        let stats = controller.register_listener(spec.kind, spec.addr);
        bound.push((spec, listener, stats));
    }
    for (spec, listener, stats) in bound {
        let ctx = Arc::clone(&ctx);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            server::serve_listener(ctx, spec, listener, stats, shutdown_rx).await;
        });
    }

    if !options.stats_interfaces.is_empty() {
        let num = options.stats_interfaces.len();
        log_info!(
            "Stats HTTP: starting {} {} ...",
            num,
            pluralize("server", num as i64)
        );
        for addr in &options.stats_interfaces {
            let listener = stats_http::bind_stats(*addr).await?;
            let controller = Arc::clone(&controller);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                stats_http::serve_stats(controller, listener, shutdown_rx).await;
            });
        }
    }

    let client = Arc::new(UpstreamClient::new(&options));
    {
        let tip = Arc::clone(&tip);
        let controller = Arc::clone(&controller);
        let poll_stats = Arc::clone(&poll_stats);
        let poll_interval = options.poll_interval_secs;
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            upstream::poll_upstream_loop(
                client,
                tip,
                controller,
                poll_stats,
                poll_interval,
                shutdown_rx,
            )
            .await;
        });
    }

    // Steady state: everything above runs until the first shutdown request.
    let mut shutdown_rx = shutdown_rx;
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }

    // Orderly drain. Listeners and the stats HTTP servers observe the watch
    // channel and stop accepting on their own.
    BLOCK_NEW.store(true, Ordering::Release);

    let extant = pool.extant_jobs();
    if extant > 0 {
        log_info!("Waiting for extant thread pool workers ...");
    }
    let drain_pool = Arc::clone(&pool);
    let drained = tokio::task::spawn_blocking(move || {
        drain_pool.shutdown_wait_for_jobs(POOL_DRAIN_TIMEOUT_MS)
    })
    .await
    .unwrap_or(false);
    if !drained {
        let left = pool.extant_jobs();
        log_warn!(
            "After {} seconds, {} thread pool {} still active. App may abort with an error.",
            POOL_DRAIN_TIMEOUT_MS / 1000,
            left,
            pluralize("worker", left as i64)
        );
    } else if extant > 0 {
        log_debug!(
            "Successfully waited for {} thread pool {}",
            extant,
            pluralize("worker", extant as i64)
        );
    }

    if !options.stats_interfaces.is_empty() {
        log_info!("Stopping Stats HTTP Servers ...");
    }

    log_info!("Stopping Controller ... ");
    controller.close_all_sessions();
    // Give session tasks a beat to flush their final replies and drop.
    tokio::time::sleep(Duration::from_millis(200)).await;

    controller.stop();
    let _ = tokio::task::spawn_blocking(move || controller_join.join()).await;
    pool.join();

    Ok(signal_code.load(Ordering::Acquire))
}

#[cfg(unix)]
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>, signal_code: Arc<AtomicI32>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                log_critical!("failed to install SIGINT handler: {err}");
                return;
            }
        };
        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigquit = signal(SignalKind::quit()).ok();
        // Hang-up is consumed and ignored.
        let mut sighup = signal(SignalKind::hangup()).ok();

        let mut deliveries = 0u32;
        loop {
            let sig = tokio::select! {
                _ = sigint.recv() => libc::SIGINT,
                _ = recv_opt(&mut sigterm) => libc::SIGTERM,
                _ = recv_opt(&mut sigquit) => libc::SIGQUIT,
                _ = recv_opt(&mut sighup) => continue,
            };
            deliveries += 1;
            match signal_disposition(deliveries) {
                SignalDisposition::Initiate => {
                    log_info!("Got signal: {sig}, exiting ...");
                    signal_code.store(sig, Ordering::Release);
                    let _ = shutdown_tx.send(true);
                }
                SignalDisposition::Duplicate => {
                    println!("Duplicate signal {sig} already being handled, ignoring");
                }
                SignalDisposition::Abort => {
                    println!("Signal {sig} caught more than 5 times, aborting");
                    std::process::abort();
                }
            }
        }
    });
}

#[cfg(unix)]
async fn recv_opt(stream: &mut Option<tokio::signal::unix::Signal>) {
    match stream.as_mut() {
        Some(stream) => {
            let _ = stream.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>, signal_code: Arc<AtomicI32>) {
    tokio::spawn(async move {
        let mut deliveries = 0u32;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            deliveries += 1;
            match signal_disposition(deliveries) {
                SignalDisposition::Initiate => {
                    log_info!("Got signal: interrupt, exiting ...");
                    signal_code.store(2, Ordering::Release);
                    let _ = shutdown_tx.send(true);
                }
                SignalDisposition::Duplicate => {
                    println!("Duplicate signal already being handled, ignoring");
                }
                SignalDisposition::Abort => {
                    println!("Signal caught more than 5 times, aborting");
                    std::process::abort();
                }
            }
        }
    });
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SignalDisposition {
    Initiate,
    Duplicate,
    Abort,
}

/// First delivery starts shutdown, the next three are counted and ignored,
/// a fifth delivery aborts the process.
fn signal_disposition(delivery: u32) -> SignalDisposition {
    match delivery {
        0 | 1 => SignalDisposition::Initiate,
        2..=4 => SignalDisposition::Duplicate,
        _ => SignalDisposition::Abort,
    }
}

struct DataDirLock {
    file: std::fs::File,
    path: PathBuf,
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Exclusive-lock the data directory so two instances cannot share it.
fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|err| format!("failed to open lock file {}: {err}", path.display()))?;
    file.try_lock_exclusive().map_err(|_| {
        format!(
            "data directory {} is locked by another instance",
            data_dir.display()
        )
    })?;
    Ok(DataDirLock { file, path })
}

type SelfTestFn = fn() -> Result<(), String>;

fn registered_tests() -> Vec<(&'static str, SelfTestFn)> {
    vec![
        ("json", selftest_json),
        ("pluralize", selftest_pluralize),
        ("dispatch", selftest_dispatch),
    ]
}

fn registered_benches() -> Vec<(&'static str, SelfTestFn)> {
    vec![("workqueue", bench_workqueue)]
}

fn run_self_tests(tests: &[String], benches: &[String]) -> i32 {
    logging::init(logging::LogConfig::default());
    for name in tests {
        let Some((_, func)) = registered_tests().into_iter().find(|(n, _)| n == name) else {
            eprintln!("No such test: {name}");
            return 1;
        };
        log_info!("Running test: {name} ...");
        if let Err(err) = func() {
            log_critical!("test {name} failed: {err}");
            return 1;
        }
    }
    for name in benches {
        let Some((_, func)) = registered_benches().into_iter().find(|(n, _)| n == name) else {
            eprintln!("No such bench: {name}");
            return 1;
        };
        log_info!("Running benchmark: {name} ...");
        if let Err(err) = func() {
            log_critical!("benchmark {name} failed: {err}");
            return 1;
        }
    }
    0
}

fn selftest_json() -> Result<(), String> {
    let value: serde_json::Value =
        serde_json::from_str(r#"{"a": [1, 2.5, "x", null, true]}"#).map_err(|e| e.to_string())?;
    let rendered = value.to_string();
    let back: serde_json::Value = serde_json::from_str(&rendered).map_err(|e| e.to_string())?;
    if back != value {
        return Err("JSON round trip mismatch".to_string());
    }
    Ok(())
}

fn selftest_pluralize() -> Result<(), String> {
    let cases = [
        ("server", 1, "server"),
        ("server", 2, "servers"),
        ("class", 2, "classes"),
        ("hash", 0, "hashes"),
        ("entry", 3, "entries"),
    ];
    for (word, n, want) in cases {
        let got = pluralize(word, n);
        if got != want {
            return Err(format!("pluralize({word:?}, {n}) = {got:?}, want {want:?}"));
        }
    }
    Ok(())
}

fn selftest_dispatch() -> Result<(), String> {
    let event_loop = dispatch::EventLoop::new("selftest");
    let handle = event_loop.handle();
    let join = event_loop.spawn().map_err(|e| e.to_string())?;
    let flag = Arc::new(AtomicBool::new(false));
    // The loop may not have recorded its thread yet; retry briefly.
    let mut ok = false;
    for _ in 0..100 {
        let flag2 = Arc::clone(&flag);
        if handle.call(move || flag2.store(true, Ordering::SeqCst), 1000) {
            ok = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    handle.stop();
    let _ = join.join();
    if !ok || !flag.load(Ordering::SeqCst) {
        return Err("dispatch call did not complete".to_string());
    }
    Ok(())
}

fn bench_workqueue() -> Result<(), String> {
    let pool = WorkerPool::new(0, 100_000);
    pool.start();
    let started = std::time::Instant::now();
    let mut accepted = 0u64;
    for _ in 0..100_000u64 {
        if pool.submit(Box::new(|| {
            std::hint::black_box(1 + 1);
        })) {
            accepted += 1;
        }
    }
    let drained = pool.shutdown_wait_for_jobs(30_000);
    let elapsed = started.elapsed();
    log_info!(
        "workqueue: accepted {accepted} jobs, drained={drained}, elapsed {:.3}s",
        elapsed.as_secs_f64()
    );
    pool.join();
    if !drained {
        return Err("bench pool failed to drain".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_counting() {
        assert_eq!(signal_disposition(1), SignalDisposition::Initiate);
        for delivery in 2..=4 {
            assert_eq!(signal_disposition(delivery), SignalDisposition::Duplicate);
        }
        assert_eq!(signal_disposition(5), SignalDisposition::Abort);
        assert_eq!(signal_disposition(60), SignalDisposition::Abort);
    }

    #[test]
    fn data_dir_lock_is_exclusive() {
        let dir = std::env::temp_dir().join(format!("lanternd-lock-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let first = lock_data_dir(&dir).expect("first lock");
        let second = lock_data_dir(&dir);
        assert!(second.is_err());
        drop(first);
        let third = lock_data_dir(&dir).expect("relock after drop");
        drop(third);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn self_test_registry() {
        let tests = registered_tests();
        assert!(tests.iter().any(|(name, _)| *name == "json"));
        for (_, func) in tests {
            func().expect("self test passes");
        }
    }

    #[test]
    fn unknown_self_test_fails() {
        assert_eq!(run_self_tests(&["nope".to_string()], &[]), 1);
        assert_eq!(run_self_tests(&[], &["nope".to_string()]), 1);
    }
}
