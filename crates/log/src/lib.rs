use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::ThreadId;
use std::time::Instant;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Fatal = 0,
    Critical = 1,
    Warning = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Critical => "CRITICAL",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

/// Log timestamp rendering mode. `Uptime` renders `[SEC.MILLIS]` relative to
/// process start; `Local`/`Utc` render wall-clock time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TsFormat {
    None = 0,
    Uptime = 1,
    Local = 2,
    Utc = 3,
}

impl TsFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "uptime" | "abs" | "abstime" => Some(Self::Uptime),
            s if s.starts_with("local") => Some(Self::Local),
            "utc" => Some(Self::Utc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Uptime => "uptime",
            Self::Local => "localtime",
            Self::Utc => "utc",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub debug: bool,
    pub trace: bool,
    pub ts_format: TsFormat,
    pub syslog: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            trace: false,
            ts_format: TsFormat::Local,
            syslog: false,
        }
    }
}

static LOG_DEBUG: AtomicBool = AtomicBool::new(false);
static LOG_TRACE: AtomicBool = AtomicBool::new(false);
static LOG_TS_FORMAT: AtomicU8 = AtomicU8::new(TsFormat::Local as u8);
static LOG_SYSLOG: AtomicBool = AtomicBool::new(false);

static PRIMARY_THREAD: OnceLock<ThreadId> = OnceLock::new();
static SINK: Mutex<()> = Mutex::new(());

struct Pending {
    level: Level,
    ts_ms: u64,
    thread_label: Option<String>,
    msg: String,
}

// Records emitted before init() are queued and flushed once the real sink is
// installed, so early option-resolution diagnostics still land in syslog.
static PRE_INIT: Mutex<Option<Vec<Pending>>> = Mutex::new(Some(Vec::new()));

fn start_instant() -> Instant {
    static T0: OnceLock<Instant> = OnceLock::new();
    *T0.get_or_init(Instant::now)
}

/// Milliseconds since process start (first clock use).
pub fn now_ms() -> u64 {
    start_instant()
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Nanoseconds since process start.
pub fn now_ns() -> u64 {
    start_instant()
        .elapsed()
        .as_nanos()
        .try_into()
        .unwrap_or(u64::MAX)
}

pub fn uptime_secs() -> f64 {
    now_ms() as f64 / 1e3
}

/// `std::time::Instant` is documented monotonic on every supported platform.
pub fn is_clock_steady() -> bool {
    true
}

fn journal_stream() -> bool {
    static SET: OnceLock<bool> = OnceLock::new();
    *SET.get_or_init(|| std::env::var_os("JOURNAL_STREAM").is_some())
}

/// Install the sink configuration and flush any records queued before init.
/// Must be called from the primary thread.
pub fn init(config: LogConfig) {
    let _ = start_instant();
    let _ = PRIMARY_THREAD.set(std::thread::current().id());
    LOG_DEBUG.store(config.debug, Ordering::Relaxed);
    LOG_TRACE.store(config.trace && config.debug, Ordering::Relaxed);
    LOG_TS_FORMAT.store(config.ts_format as u8, Ordering::Relaxed);
    LOG_SYSLOG.store(config.syslog, Ordering::Relaxed);
    #[cfg(unix)]
    if config.syslog {
        syslog_open();
    }

    let queued = PRE_INIT.lock().ok().and_then(|mut slot| slot.take());
    if let Some(records) = queued {
        for record in records {
            write_record(
                record.level,
                record.ts_ms,
                record.thread_label.as_deref(),
                &record.msg,
            );
        }
    }
}

pub fn set_debug(enabled: bool) {
    LOG_DEBUG.store(enabled, Ordering::Relaxed);
    if !enabled {
        LOG_TRACE.store(false, Ordering::Relaxed);
    }
}

pub fn set_trace(enabled: bool) {
    LOG_TRACE.store(enabled, Ordering::Relaxed);
    if enabled {
        LOG_DEBUG.store(true, Ordering::Relaxed);
    }
}

pub fn enabled(level: Level) -> bool {
    match level {
        Level::Trace => LOG_TRACE.load(Ordering::Relaxed),
        Level::Debug => LOG_DEBUG.load(Ordering::Relaxed),
        _ => true,
    }
}

fn thread_label() -> Option<String> {
    let current = std::thread::current();
    match PRIMARY_THREAD.get() {
        Some(primary) if *primary == current.id() => None,
        // Not yet initialized: only bootstrap code runs then.
        None => None,
        Some(_) => Some(match current.name() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => format!("{:?}", current.id()),
        }),
    }
}

pub fn log(level: Level, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let ts_ms = now_ms();
    let label = thread_label();
    let msg = args.to_string();

    if let Ok(mut slot) = PRE_INIT.lock() {
        if let Some(queue) = slot.as_mut() {
            queue.push(Pending {
                level,
                ts_ms,
                thread_label: label,
                msg,
            });
            return;
        }
    }
    write_record(level, ts_ms, label.as_deref(), &msg);
}

fn write_record(level: Level, ts_ms: u64, thread_label: Option<&str>, msg: &str) {
    #[cfg(unix)]
    if LOG_SYSLOG.load(Ordering::Relaxed) {
        // The uptime timestamp is kept in the payload even under syslog: lines
        // from threads may be serialized out of order and the timestamp is the
        // only record of what actually happened first.
        let mut line = String::with_capacity(msg.len() + 24);
        push_uptime_ts(&mut line, ts_ms);
        if let Some(label) = thread_label {
            line.push_str("<Thread: ");
            line.push_str(label);
            line.push_str("> ");
        }
        line.push_str(msg);
        syslog_write(level, &line);
        return;
    }

    let colorize = !journal_stream() && io::stderr().is_terminal();
    let mut line = String::with_capacity(msg.len() + 48);
    if !journal_stream() {
        match ts_format() {
            TsFormat::None => {}
            TsFormat::Uptime => push_uptime_ts(&mut line, ts_ms),
            TsFormat::Local => {
                let now = chrono::Local::now();
                line.push_str(&format!("[{}] ", now.format("%Y-%m-%d %H:%M:%S%.3f")));
            }
            TsFormat::Utc => {
                let now = chrono::Utc::now();
                line.push_str(&format!("[{}] ", now.format("%Y-%m-%d %H:%M:%S%.3f Z")));
            }
        }
    }
    if let Some(label) = thread_label {
        line.push_str("<Thread: ");
        line.push_str(label);
        line.push_str("> ");
    }
    match level {
        Level::Info => {}
        Level::Debug => line.push_str("(Debug) "),
        Level::Trace => line.push_str("(Trace) "),
        Level::Warning => line.push_str("Warning: "),
        Level::Critical | Level::Fatal => line.push_str(&format!("{}: ", level.as_str())),
    }

    let guard = SINK.lock();
    let mut out = io::stderr().lock();
    if colorize {
        let (pre, post) = color_codes(level);
        let _ = writeln!(out, "{pre}{line}{msg}{post}");
    } else {
        let _ = writeln!(out, "{line}{msg}");
    }
    drop(guard);
}

fn ts_format() -> TsFormat {
    match LOG_TS_FORMAT.load(Ordering::Relaxed) {
        0 => TsFormat::None,
        1 => TsFormat::Uptime,
        3 => TsFormat::Utc,
        _ => TsFormat::Local,
    }
}

fn push_uptime_ts(line: &mut String, ts_ms: u64) {
    line.push_str(&format!("[{}.{:03}] ", ts_ms / 1000, ts_ms % 1000));
}

fn color_codes(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::Fatal | Level::Critical => ("\x1b[31;1m", "\x1b[0m"),
        Level::Warning => ("\x1b[33m", "\x1b[0m"),
        Level::Debug => ("\x1b[36m", "\x1b[0m"),
        Level::Trace => ("\x1b[32m", "\x1b[0m"),
        Level::Info => ("", ""),
    }
}

#[cfg(unix)]
fn syslog_open() {
    static OPENED: OnceLock<()> = OnceLock::new();
    OPENED.get_or_init(|| {
        // The ident must outlive the syslog connection.
        let ident: &'static std::ffi::CStr = Box::leak(
            std::ffi::CString::new(env!("CARGO_PKG_NAME"))
                .unwrap_or_else(|_| std::ffi::CString::new("lanternd").expect("cstr"))
                .into_boxed_c_str(),
        );
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON) };
    });
}

#[cfg(unix)]
fn syslog_write(level: Level, line: &str) {
    syslog_open();
    let priority = match level {
        Level::Fatal | Level::Critical => libc::LOG_CRIT,
        Level::Warning => libc::LOG_WARNING,
        Level::Info => libc::LOG_INFO,
        Level::Debug | Level::Trace => libc::LOG_DEBUG,
    };
    let Ok(payload) = std::ffi::CString::new(line.replace('\0', " ")) else {
        return;
    };
    unsafe {
        libc::syslog(priority, b"%s\0".as_ptr().cast(), payload.as_ptr());
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_fatal {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Fatal, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_critical {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Critical, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warning, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ts_format() {
        assert_eq!(TsFormat::parse("none"), Some(TsFormat::None));
        assert_eq!(TsFormat::parse("uptime"), Some(TsFormat::Uptime));
        assert_eq!(TsFormat::parse("abstime"), Some(TsFormat::Uptime));
        assert_eq!(TsFormat::parse("localtime"), Some(TsFormat::Local));
        assert_eq!(TsFormat::parse("local"), Some(TsFormat::Local));
        assert_eq!(TsFormat::parse("UTC"), Some(TsFormat::Utc));
        assert_eq!(TsFormat::parse("nope"), None);
    }

    #[test]
    fn clock_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        let x = now_ns();
        let y = now_ns();
        assert!(y >= x);
        assert!(is_clock_steady());
    }

    #[test]
    fn uptime_prefix_format() {
        let mut line = String::new();
        push_uptime_ts(&mut line, 12_045);
        assert_eq!(line, "[12.045] ");
        line.clear();
        push_uptime_ts(&mut line, 7);
        assert_eq!(line, "[0.007] ");
    }

    #[test]
    fn level_gating() {
        set_debug(false);
        assert!(enabled(Level::Info));
        assert!(enabled(Level::Warning));
        assert!(!enabled(Level::Debug));
        assert!(!enabled(Level::Trace));
        set_debug(true);
        assert!(enabled(Level::Debug));
        assert!(!enabled(Level::Trace));
        set_trace(true);
        assert!(enabled(Level::Trace));
        set_debug(false);
        assert!(!enabled(Level::Trace));
    }
}
