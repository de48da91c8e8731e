use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::logging;
use crate::util::{parse_host_port, parse_interface, pluralize};

pub const DEFAULT_PORT_TCP: u16 = 50001;
pub const DEFAULT_PORT_SSL: u16 = 50002;
pub const DEFAULT_PORT_WS: u16 = 50003;
pub const DEFAULT_PORT_WSS: u16 = 50004;

pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 2.0;
pub const MIN_POLL_INTERVAL_SECS: f64 = 0.5;
pub const MAX_POLL_INTERVAL_SECS: f64 = 30.0;

pub const MAX_HISTORY_MIN: usize = 1000;
pub const MAX_HISTORY_MAX: usize = 100_000_000;
pub const DEFAULT_MAX_HISTORY: usize = 125_000;

pub const MAX_BUFFER_MIN: usize = 64 * 1024;
pub const MAX_BUFFER_MAX: usize = 100_000_000;
pub const DEFAULT_MAX_BUFFER: usize = 4_000_000;

pub const MAX_SUBS_PER_IP_MIN: usize = 500;
pub const MAX_SUBS_PER_IP_MAX: usize = 25_000_000;
pub const DEFAULT_MAX_SUBS_PER_IP: usize = 75_000;

pub const MAX_SUBS_MIN: usize = 5000;
pub const MAX_SUBS_MAX: usize = 100_000_000;
pub const DEFAULT_MAX_SUBS: usize = 10_000_000;

pub const DEFAULT_MAX_CLIENTS_PER_IP: usize = 12;

pub const MIN_WORK_QUEUE: usize = 10;
pub const DEFAULT_WORK_QUEUE: usize = 1000;

pub const MIN_MAX_PENDING_CONNECTIONS: u32 = 10;
pub const MAX_MAX_PENDING_CONNECTIONS: u32 = 9999;
pub const DEFAULT_MAX_PENDING_CONNECTIONS: u32 = 60;

pub const DB_MAX_OPEN_FILES_MIN: i64 = 20;
pub const DB_MAX_OPEN_FILES_MAX: i64 = 100_000;
pub const DB_KEEP_LOG_FILE_NUM_MIN: i64 = 5;
pub const DB_KEEP_LOG_FILE_NUM_MAX: i64 = 20_000;

/// User-facing configuration failures exit 1; internal invariant violations
/// are logged at Critical before exiting.
#[derive(Debug)]
pub enum OptionsError {
    BadArgs(String),
    Internal(String),
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArgs(msg) => write!(f, "{msg}"),
            Self::Internal(msg) => write!(f, "Internal Error: {msg}"),
        }
    }
}

fn bad_args(msg: impl Into<String>) -> OptionsError {
    OptionsError::BadArgs(msg.into())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Transport {
    Tcp,
    Ssl,
    Ws,
    Wss,
    Admin,
    Stats,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ssl => "ssl",
            Self::Ws => "ws",
            Self::Wss => "wss",
            Self::Admin => "admin",
            Self::Stats => "stats",
        }
    }

    pub fn is_encrypted(self) -> bool {
        matches!(self, Self::Ssl | Self::Wss)
    }
}

/// Certificate material shared read-only by every TLS/WSS listener.
pub struct CertInfo {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub key_algorithm: &'static str,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl fmt::Debug for CertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertInfo")
            .field("certs", &self.certs.len())
            .field("key_algorithm", &self.key_algorithm)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct ListenerSpec {
    pub kind: Transport,
    pub addr: SocketAddr,
    pub cert: Option<Arc<CertInfo>>,
}

/// A CIDR subnet exempt from per-IP limits. Bare addresses parse as
/// host-length prefixes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Subnet(pub IpNet);

impl Subnet {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(net) = raw.parse::<IpNet>() {
            return Some(Self(net));
        }
        let ip = raw.parse::<IpAddr>().ok()?;
        Some(Self(IpNet::from(ip)))
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upstream request throttling: back off above `hi` outstanding requests,
/// resume below `lo`, decaying the counter every `decay` seconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThrottleParams {
    pub hi: u32,
    pub lo: u32,
    pub decay: u32,
}

impl ThrottleParams {
    pub fn is_valid(&self) -> bool {
        self.hi >= self.lo
    }
}

impl Default for ThrottleParams {
    fn default() -> Self {
        Self {
            hi: 50,
            lo: 20,
            decay: 5,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DbOptions {
    pub max_open_files: i64,
    pub keep_log_file_num: u32,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            max_open_files: -1,
            keep_log_file_num: 5,
        }
    }
}

/// Immutable runtime configuration, resolved once at startup from CLI, config
/// file and environment (in that precedence order) and then shared read-only.
/// The only runtime-adjustable knob is `max_buffer`.
#[derive(Debug)]
pub struct Options {
    pub datadir: PathBuf,
    pub bitcoind: (String, u16),
    pub bitcoind_tls: bool,
    pub rpcuser: String,
    pub rpcpassword: String,
    pub poll_interval_secs: f64,

    pub tcp_interfaces: Vec<SocketAddr>,
    pub ssl_interfaces: Vec<SocketAddr>,
    pub ws_interfaces: Vec<SocketAddr>,
    pub wss_interfaces: Vec<SocketAddr>,
    pub admin_interfaces: Vec<SocketAddr>,
    pub stats_interfaces: Vec<SocketAddr>,

    pub cert: Option<Arc<CertInfo>>,
    pub wss_cert: Option<Arc<CertInfo>>,

    pub public_tcp_port: Option<u16>,
    pub public_ssl_port: Option<u16>,
    pub public_ws_port: Option<u16>,
    pub public_wss_port: Option<u16>,

    pub max_clients_per_ip: usize,
    pub subnets_excluded_from_per_ip_limits: Vec<Subnet>,
    pub max_subs_globally: usize,
    pub max_subs_per_ip: usize,
    pub max_history: usize,
    max_buffer: AtomicUsize,

    pub work_queue: usize,
    pub worker_threads: usize,
    pub max_pending_connections: u32,
    pub bitcoind_throttle: ThrottleParams,

    pub peering: bool,
    pub announce: bool,
    pub peering_enforce_unique_ip: bool,
    pub hostname: Option<String>,
    pub donation_address: String,
    pub banner_file: Option<PathBuf>,

    pub tor_hostname: Option<String>,
    pub tor_banner_file: Option<PathBuf>,
    pub tor_tcp_port: Option<u16>,
    pub tor_ssl_port: Option<u16>,
    pub tor_ws_port: Option<u16>,
    pub tor_wss_port: Option<u16>,
    pub tor_proxy: Option<SocketAddr>,
    pub tor_user: String,
    pub tor_pass: String,

    pub ts_format: logging::TsFormat,
    pub syslog: bool,
    pub tls_disallow_deprecated: bool,
    pub dump_script_hashes: Option<PathBuf>,
    pub check_db: bool,
    pub verbose_debug: bool,
    pub verbose_trace: bool,
    pub db: DbOptions,
}

impl Options {
    pub fn max_buffer(&self) -> usize {
        self.max_buffer.load(Ordering::Relaxed)
    }

    pub fn is_max_buffer_in_bounds(value: i64) -> bool {
        value >= MAX_BUFFER_MIN as i64 && value <= MAX_BUFFER_MAX as i64
    }

    /// Runtime max_buffer change (admin `maxbuffer`). Out-of-range values are
    /// ignored with a Warning, matching the startup bounds.
    pub fn set_max_buffer(&self, value: i64) -> bool {
        if Self::is_max_buffer_in_bounds(value) {
            self.max_buffer.store(value as usize, Ordering::Relaxed);
            true
        } else {
            log_warn!("{value} is out of range, ignoring new max_buffer setting");
            false
        }
    }

    /// Every configured listener, stats listeners excluded (the stats HTTP
    /// server is bound separately).
    pub fn listeners(&self) -> Vec<ListenerSpec> {
        let mut out = Vec::new();
        for addr in &self.tcp_interfaces {
            out.push(ListenerSpec {
                kind: Transport::Tcp,
                addr: *addr,
                cert: None,
            });
        }
        for addr in &self.ssl_interfaces {
            out.push(ListenerSpec {
                kind: Transport::Ssl,
                addr: *addr,
                cert: self.cert.clone(),
            });
        }
        for addr in &self.ws_interfaces {
            out.push(ListenerSpec {
                kind: Transport::Ws,
                addr: *addr,
                cert: None,
            });
        }
        for addr in &self.wss_interfaces {
            out.push(ListenerSpec {
                kind: Transport::Wss,
                addr: *addr,
                cert: self.wss_cert.clone().or_else(|| self.cert.clone()),
            });
        }
        for addr in &self.admin_interfaces {
            out.push(ListenerSpec {
                kind: Transport::Admin,
                addr: *addr,
                cert: None,
            });
        }
        out
    }

    pub fn is_ip_exempt_from_per_ip_limits(&self, ip: &IpAddr) -> bool {
        self.subnets_excluded_from_per_ip_limits
            .iter()
            .any(|subnet| subnet.contains(ip))
    }

    /// Fully defaulted options for unit tests; bypasses resolution so tests
    /// never touch the filesystem or environment.
    #[cfg(test)]
    pub(crate) fn test_default() -> Self {
        Self {
            datadir: std::env::temp_dir(),
            bitcoind: ("127.0.0.1".to_string(), 8332),
            bitcoind_tls: false,
            rpcuser: "user".to_string(),
            rpcpassword: "pass".to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            tcp_interfaces: Vec::new(),
            ssl_interfaces: Vec::new(),
            ws_interfaces: Vec::new(),
            wss_interfaces: Vec::new(),
            admin_interfaces: Vec::new(),
            stats_interfaces: Vec::new(),
            cert: None,
            wss_cert: None,
            public_tcp_port: None,
            public_ssl_port: None,
            public_ws_port: None,
            public_wss_port: None,
            max_clients_per_ip: DEFAULT_MAX_CLIENTS_PER_IP,
            subnets_excluded_from_per_ip_limits: Vec::new(),
            max_subs_globally: DEFAULT_MAX_SUBS,
            max_subs_per_ip: DEFAULT_MAX_SUBS_PER_IP,
            max_history: DEFAULT_MAX_HISTORY,
            max_buffer: AtomicUsize::new(DEFAULT_MAX_BUFFER),
            work_queue: DEFAULT_WORK_QUEUE,
            worker_threads: 0,
            max_pending_connections: DEFAULT_MAX_PENDING_CONNECTIONS,
            bitcoind_throttle: ThrottleParams::default(),
            peering: true,
            announce: false,
            peering_enforce_unique_ip: true,
            hostname: None,
            donation_address: String::new(),
            banner_file: None,
            tor_hostname: None,
            tor_banner_file: None,
            tor_tcp_port: None,
            tor_ssl_port: None,
            tor_ws_port: None,
            tor_wss_port: None,
            tor_proxy: None,
            tor_user: String::new(),
            tor_pass: String::new(),
            ts_format: logging::TsFormat::None,
            syslog: false,
            tls_disallow_deprecated: false,
            dump_script_hashes: None,
            check_db: false,
            verbose_debug: false,
            verbose_trace: false,
            db: DbOptions::default(),
        }
    }
}

/// `key = value` config file. Repeated keys accumulate; `#`/`;` start
/// comments; a key with no `=` counts as `key = 1`.
#[derive(Debug, Default)]
pub struct ConfFile {
    values: HashMap<String, Vec<String>>,
}

impl ConfFile {
    pub fn load(path: &Path) -> Result<Self, OptionsError> {
        let contents = fs::read_to_string(path)
            .map_err(|err| bad_args(format!("Unable to open config file {}: {err}", path.display())))?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut values: HashMap<String, Vec<String>> = HashMap::new();
        for raw_line in contents.lines() {
            let mut line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(idx) = line.find('#') {
                line = &line[..idx];
            }
            if let Some(idx) = line.find(';') {
                line = &line[..idx];
            }
            line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (line, "1"),
            };
            if key.is_empty() {
                continue;
            }
            values
                .entry(key.to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
        Self { values }
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|list| list.last())
            .map(String::as_str)
    }

    pub fn values(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bool_value(&self, key: &str) -> bool {
        match self.value(key) {
            Some(raw) => conf_bool(raw),
            None => false,
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }
}

/// Booleans accept `yes|true|on|1|<empty>` (any nonzero integer also counts).
pub fn conf_bool(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return true;
    }
    if let Ok(n) = raw.parse::<i64>() {
        return n != 0;
    }
    matches!(raw.to_ascii_lowercase().as_str(), "yes" | "true" | "on")
}

#[derive(Debug, Clone)]
pub struct Env {
    pub rpcuser: Option<String>,
    pub rpcpassword: Option<String>,
}

impl Env {
    pub fn from_process() -> Self {
        Self {
            rpcuser: std::env::var("RPCUSER").ok(),
            rpcpassword: std::env::var("RPCPASSWORD").ok(),
        }
    }
}

pub enum CliAction {
    Run(Box<Options>),
    SelfTest {
        tests: Vec<String>,
        benches: Vec<String>,
    },
    PrintHelp,
    PrintVersion,
}

/// Raw CLI state: typed values plus the set of long names seen, so the
/// resolver can warn when a key is set both here and in the config file.
#[derive(Debug, Default)]
struct CliArgs {
    set: HashSet<&'static str>,
    datadir: Option<String>,
    tcp: Vec<String>,
    ssl: Vec<String>,
    ws: Vec<String>,
    wss: Vec<String>,
    cert: Option<String>,
    key: Option<String>,
    wss_cert: Option<String>,
    wss_key: Option<String>,
    admin: Vec<String>,
    stats: Vec<String>,
    bitcoind: Vec<String>,
    bitcoind_tls: bool,
    rpcuser: Option<String>,
    rpcpassword: Option<String>,
    debug_count: u32,
    quiet: bool,
    syslog: bool,
    checkdb: bool,
    polltime: Option<String>,
    ts_format: Option<String>,
    tls_disallow_deprecated: bool,
    dump_sh: Option<String>,
    tests: Vec<String>,
    benches: Vec<String>,
    config_file: Option<String>,
}

pub fn usage() -> String {
    format!(
        "Usage: {name} [options] [config]\n\
         A Bitcoin-family blockchain SPV server.\n\n\
         \x20 -D, --datadir <path>        data directory (required; created if missing)\n\
         \x20 -b, --bitcoind <host:port>  bitcoind JSON-RPC endpoint (required)\n\
         \x20     --bitcoind-tls          connect to bitcoind over HTTPS\n\
         \x20 -u, --rpcuser <user>        bitcoind RPC username (or env RPCUSER)\n\
         \x20 -p, --rpcpassword <pass>    bitcoind RPC password (or env RPCPASSWORD)\n\
         \x20 -t, --tcp <iface:port>      TCP listener (repeatable; suggested port {tcp})\n\
         \x20 -s, --ssl <iface:port>      TLS listener (repeatable; needs --cert/--key; suggested port {ssl})\n\
         \x20 -w, --ws <iface:port>       WebSocket listener (repeatable; suggested port {ws})\n\
         \x20 -W, --wss <iface:port>      Secure WebSocket listener (repeatable; suggested port {wss})\n\
         \x20 -c, --cert <file>           server certificate (PEM)\n\
         \x20 -k, --key <file>            server private key (PEM)\n\
         \x20     --wss-cert <file>       WSS-only certificate (pairs with --wss-key)\n\
         \x20     --wss-key <file>        WSS-only private key (pairs with --wss-cert)\n\
         \x20 -a, --admin [iface:]port    admin RPC listener (repeatable; bare port = loopback)\n\
         \x20 -z, --stats [iface:]port    stats HTTP listener (repeatable; bare port = loopback)\n\
         \x20 -T, --polltime <secs>       bitcoind poll interval, {min} to {max}\n\
         \x20 -d, --debug                 verbose debug output (twice for trace)\n\
         \x20 -q, --quiet                 suppress debug output\n\
         \x20 -S, --syslog                log via syslog (Unix)\n\
         \x20 -C, --checkdb               run thorough database checks at startup\n\
         \x20     --ts-format <kw>        log timestamps: none|uptime|localtime|utc\n\
         \x20     --tls-disallow-deprecated  restrict TLS to v1.2 or newer\n\
         \x20     --dump-sh <file>        dump script hashes to file and continue\n\
         \x20     --test <name>           run a registered test and exit (repeatable)\n\
         \x20     --bench <name>          run a registered benchmark and exit (repeatable)\n\
         \x20 -h, --help                  show this help\n\
         \x20 -v, --version               show version",
        name = env!("CARGO_PKG_NAME"),
        min = MIN_POLL_INTERVAL_SECS,
        max = MAX_POLL_INTERVAL_SECS,
        tcp = DEFAULT_PORT_TCP,
        ssl = DEFAULT_PORT_SSL,
        ws = DEFAULT_PORT_WS,
        wss = DEFAULT_PORT_WSS,
    )
}

pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliAction, OptionsError> {
    parse_args_with_env(args, Env::from_process())
}

pub fn parse_args_with_env(
    args: impl IntoIterator<Item = String>,
    env: Env,
) -> Result<CliAction, OptionsError> {
    let cli = parse_cli(args)?;
    if cli.set.contains("help") {
        return Ok(CliAction::PrintHelp);
    }
    if cli.set.contains("version") {
        return Ok(CliAction::PrintVersion);
    }
    if !cli.tests.is_empty() || !cli.benches.is_empty() {
        return Ok(CliAction::SelfTest {
            tests: cli.tests,
            benches: cli.benches,
        });
    }
    let conf = match &cli.config_file {
        Some(path) => ConfFile::load(Path::new(path))?,
        None => ConfFile::default(),
    };
    resolve(cli, conf, env).map(|options| CliAction::Run(Box::new(options)))
}

fn take_value(
    args: &mut std::vec::IntoIter<String>,
    arg: &str,
    inline: Option<String>,
) -> Result<String, OptionsError> {
    if let Some(value) = inline {
        return Ok(value);
    }
    args.next()
        .ok_or_else(|| bad_args(format!("missing value for {arg}\n{}", usage())))
}

fn parse_cli(args: impl IntoIterator<Item = String>) -> Result<CliArgs, OptionsError> {
    let mut cli = CliArgs::default();
    let mut args = args.into_iter().collect::<Vec<_>>().into_iter();

    while let Some(raw) = args.next() {
        let (arg, inline) = match raw.split_once('=') {
            Some((name, value)) if name.starts_with("--") => {
                (name.to_string(), Some(value.to_string()))
            }
            _ => (raw.clone(), None),
        };
        match arg.as_str() {
            "-h" | "--help" => {
                cli.set.insert("help");
                return Ok(cli);
            }
            "-v" | "--version" => {
                cli.set.insert("version");
                return Ok(cli);
            }
            "-D" | "--datadir" => {
                cli.datadir = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("datadir");
            }
            "-t" | "--tcp" => {
                cli.tcp.push(take_value(&mut args, &arg, inline)?);
                cli.set.insert("tcp");
            }
            "-s" | "--ssl" => {
                cli.ssl.push(take_value(&mut args, &arg, inline)?);
                cli.set.insert("ssl");
            }
            "-w" | "--ws" => {
                cli.ws.push(take_value(&mut args, &arg, inline)?);
                cli.set.insert("ws");
            }
            "-W" | "--wss" => {
                cli.wss.push(take_value(&mut args, &arg, inline)?);
                cli.set.insert("wss");
            }
            "-c" | "--cert" => {
                cli.cert = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("cert");
            }
            "-k" | "--key" => {
                cli.key = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("key");
            }
            "--wss-cert" => {
                cli.wss_cert = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("wss-cert");
            }
            "--wss-key" => {
                cli.wss_key = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("wss-key");
            }
            "-a" | "--admin" => {
                cli.admin.push(take_value(&mut args, &arg, inline)?);
                cli.set.insert("admin");
            }
            "-z" | "--stats" => {
                cli.stats.push(take_value(&mut args, &arg, inline)?);
                cli.set.insert("stats");
            }
            "-b" | "--bitcoind" => {
                cli.bitcoind.push(take_value(&mut args, &arg, inline)?);
                cli.set.insert("bitcoind");
            }
            "--bitcoind-tls" => {
                cli.bitcoind_tls = true;
                cli.set.insert("bitcoind-tls");
            }
            "-u" | "--rpcuser" => {
                cli.rpcuser = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("rpcuser");
            }
            "-p" | "--rpcpassword" => {
                cli.rpcpassword = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("rpcpassword");
            }
            "-d" | "--debug" => {
                cli.debug_count += 1;
                cli.set.insert("debug");
            }
            "-q" | "--quiet" => {
                cli.quiet = true;
                cli.set.insert("quiet");
            }
            "-S" | "--syslog" => {
                cli.syslog = true;
                cli.set.insert("syslog");
            }
            "-C" | "--checkdb" => {
                cli.checkdb = true;
                cli.set.insert("checkdb");
            }
            "-T" | "--polltime" => {
                cli.polltime = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("polltime");
            }
            "--ts-format" => {
                cli.ts_format = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("ts-format");
            }
            "--tls-disallow-deprecated" => {
                cli.tls_disallow_deprecated = true;
                cli.set.insert("tls-disallow-deprecated");
            }
            "--dump-sh" => {
                cli.dump_sh = Some(take_value(&mut args, &arg, inline)?);
                cli.set.insert("dump-sh");
            }
            "--test" => {
                cli.tests.push(take_value(&mut args, &arg, inline)?);
            }
            "--bench" => {
                cli.benches.push(take_value(&mut args, &arg, inline)?);
            }
            other if other.starts_with('-') => {
                return Err(bad_args(format!("Unknown option '{other}'\n{}", usage())));
            }
            _ => {
                if cli.config_file.is_some() {
                    return Err(bad_args(
                        "More than 1 config file was specified. Please specify at most 1 config file.",
                    ));
                }
                cli.config_file = Some(raw);
            }
        }
    }
    Ok(cli)
}

fn resolve(mut cli: CliArgs, mut conf: ConfFile, env: Env) -> Result<Options, OptionsError> {
    // Verbosity first so resolution diagnostics below are gated correctly
    // while they queue for the post-init flush.
    let mut verbose_debug = cli.debug_count > 0 || conf.bool_value("debug");
    let conf_debug_count = conf
        .values("debug")
        .iter()
        .filter(|raw| conf_bool(raw))
        .count() as u32;
    let mut verbose_trace =
        cli.debug_count > 1 || (cli.debug_count == 0 && conf_debug_count > 1);
    if cli.quiet || conf.bool_value("quiet") {
        verbose_debug = false;
        verbose_trace = false;
    }
    logging::set_debug(verbose_debug);
    logging::set_trace(verbose_trace);

    // CLI beats the config file: same key in both drops the conf copy, with a
    // warning naming the key.
    let long_names = [
        "datadir",
        "tcp",
        "ssl",
        "ws",
        "wss",
        "cert",
        "key",
        "wss-cert",
        "wss-key",
        "admin",
        "stats",
        "bitcoind",
        "bitcoind-tls",
        "rpcuser",
        "rpcpassword",
        "debug",
        "quiet",
        "syslog",
        "checkdb",
        "polltime",
        "ts-format",
        "tls-disallow-deprecated",
        "dump-sh",
    ];
    for name in long_names {
        if cli.set.contains(name) && conf.has(name) {
            log_warn!(
                "'{name}' specified both via the CLI and the configuration file. The CLI arg will take precedence."
            );
            conf.remove(name);
        }
    }

    let syslog = cli.syslog || conf.bool_value("syslog");
    let check_db = cli.checkdb || conf.bool_value("checkdb");
    let bitcoind_tls = cli.bitcoind_tls || conf.bool_value("bitcoind-tls");
    if bitcoind_tls {
        log_debug!("config: bitcoind-tls = true");
    }

    // polltime
    let polltime_raw = cli
        .polltime
        .clone()
        .or_else(|| conf.value("polltime").map(str::to_string));
    let poll_interval_secs = match polltime_raw {
        None => DEFAULT_POLL_INTERVAL_SECS,
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(value)
                if value >= MIN_POLL_INTERVAL_SECS && value <= MAX_POLL_INTERVAL_SECS =>
            {
                value
            }
            _ => {
                return Err(bad_args(format!(
                    "The 'polltime' option must be a numeric value in the range [{MIN_POLL_INTERVAL_SECS}, {MAX_POLL_INTERVAL_SECS}]"
                )))
            }
        },
    };

    // Required options, checked before any filesystem work.
    struct Required<'a> {
        short: &'a str,
        long: &'a str,
        env_name: Option<&'a str>,
        cli_value: Option<String>,
        env_value: Option<String>,
    }
    let required = [
        Required {
            short: "D",
            long: "datadir",
            env_name: None,
            cli_value: cli.datadir.clone(),
            env_value: None,
        },
        Required {
            short: "b",
            long: "bitcoind",
            env_name: None,
            cli_value: cli.bitcoind.last().cloned(),
            env_value: None,
        },
        Required {
            short: "u",
            long: "rpcuser",
            env_name: Some("RPCUSER"),
            cli_value: cli.rpcuser.clone(),
            env_value: env.rpcuser.clone(),
        },
        Required {
            short: "p",
            long: "rpcpassword",
            env_name: Some("RPCPASSWORD"),
            cli_value: cli.rpcpassword.clone(),
            env_value: env.rpcpassword.clone(),
        },
    ];
    for req in &required {
        let cli_is_set = req.cli_value.is_some();
        let conf_is_set = conf.has(req.long);
        if (cli_is_set || conf_is_set) && req.env_value.is_some() {
            let via = if cli_is_set { "CLI" } else { "config file" };
            let wins = if cli_is_set {
                "CLI arg"
            } else {
                "config file setting"
            };
            log_warn!(
                "{} is specified both via the {via} and the environment (as {}). The {wins} will take precedence.",
                req.long,
                req.env_name.unwrap_or("?"),
            );
        }
        let effective = req
            .cli_value
            .clone()
            .or_else(|| conf.value(req.long).map(str::to_string))
            .or_else(|| req.env_value.clone());
        if effective.map(|v| v.trim().is_empty()).unwrap_or(true) {
            let env_note = req
                .env_name
                .map(|name| format!(" (or env var: {name})"))
                .unwrap_or_default();
            return Err(bad_args(format!(
                "Required option missing or empty: -{} (--{}){env_note}",
                req.short, req.long
            )));
        }
        if cli.bitcoind.len() > 1 && req.long == "bitcoind" {
            return Err(bad_args(format!(
                "Option specified multiple times: -{} (--{})",
                req.short, req.long
            )));
        }
        if conf.values(req.long).len() > 1 {
            return Err(bad_args(format!(
                "This option cannot be specified multiple times in the config file: {}",
                req.long
            )));
        }
    }

    // datadir: created if missing, must be a traversable directory.
    let datadir_raw = cli
        .datadir
        .take()
        .or_else(|| conf.value("datadir").map(str::to_string))
        .ok_or_else(|| OptionsError::Internal("datadir missing after required check".into()))?;
    let datadir = PathBuf::from(&datadir_raw);
    if datadir.exists() {
        if !datadir.is_dir() {
            return Err(bad_args(format!(
                "The specified path \"{datadir_raw}\" already exists but is not a directory"
            )));
        }
        if fs::read_dir(&datadir).is_err() {
            return Err(bad_args(format!(
                "Bad permissions for path \"{datadir_raw}\" (must be readable, writable, and executable)"
            )));
        }
        log_debug!("datadir: {}", datadir.display());
    } else {
        fs::create_dir_all(&datadir)
            .map_err(|_| bad_args(format!("Unable to create directory: {datadir_raw}")))?;
        log_debug!("datadir: Created directory {}", datadir.display());
    }

    let bitcoind_raw = cli
        .bitcoind
        .last()
        .cloned()
        .or_else(|| conf.value("bitcoind").map(str::to_string))
        .ok_or_else(|| OptionsError::Internal("bitcoind missing after required check".into()))?;
    let bitcoind = parse_host_port(&bitcoind_raw, false).map_err(bad_args)?;

    let rpcuser = cli
        .rpcuser
        .take()
        .or_else(|| conf.value("rpcuser").map(str::to_string))
        .or(env.rpcuser)
        .ok_or_else(|| OptionsError::Internal("rpcuser missing after required check".into()))?;
    let rpcpassword = cli
        .rpcpassword
        .take()
        .or_else(|| conf.value("rpcpassword").map(str::to_string))
        .or(env.rpcpassword)
        .ok_or_else(|| OptionsError::Internal("rpcpassword missing after required check".into()))?;

    // Listener interfaces. TCP defaults to 0.0.0.0:50001 only when no
    // interface option of any transport was given.
    let pick_list = |cli_list: &[String], key: &str, conf: &ConfFile| -> Vec<String> {
        if !cli_list.is_empty() {
            cli_list.to_vec()
        } else {
            conf.values(key).to_vec()
        }
    };
    let tcp_raw = pick_list(&cli.tcp, "tcp", &conf);
    let ssl_raw = pick_list(&cli.ssl, "ssl", &conf);
    let ws_raw = pick_list(&cli.ws, "ws", &conf);
    let wss_raw = pick_list(&cli.wss, "wss", &conf);

    let parse_list = |raw: &[String], implicit_loopback: bool| -> Result<Vec<SocketAddr>, OptionsError> {
        raw.iter()
            .map(|spec| parse_interface(spec, implicit_loopback).map_err(bad_args))
            .collect()
    };

    let mut tcp_interfaces = parse_list(&tcp_raw, false)?;
    let ssl_interfaces = parse_list(&ssl_raw, false)?;
    let ws_interfaces = parse_list(&ws_raw, false)?;
    let wss_interfaces = parse_list(&wss_raw, false)?;
    if tcp_raw.is_empty() && ssl_raw.is_empty() && ws_raw.is_empty() && wss_raw.is_empty() {
        tcp_interfaces = vec![SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT_TCP))];
    }

    let admin_interfaces = parse_list(&pick_list(&cli.admin, "admin", &conf), true)?;
    let stats_interfaces = parse_list(&pick_list(&cli.stats, "stats", &conf), true)?;
    for iface in &admin_interfaces {
        if !iface.ip().is_loopback() {
            log_warn!(
                "Binding admin RPC port to non-loopback interface {iface} is not recommended. Please ensure that this port is not globally reachable from the internet."
            );
        }
    }

    // Certificates.
    let cert_path = cli.cert.take().or_else(|| conf.value("cert").map(str::to_string));
    let key_path = cli.key.take().or_else(|| conf.value("key").map(str::to_string));
    let wss_cert_path = cli
        .wss_cert
        .take()
        .or_else(|| conf.value("wss-cert").map(str::to_string));
    let wss_key_path = cli
        .wss_key
        .take()
        .or_else(|| conf.value("wss-key").map(str::to_string));

    let has_ssl = !ssl_interfaces.is_empty();
    let has_wss = !wss_interfaces.is_empty();
    let mut cert: Option<Arc<CertInfo>> = None;
    let mut wss_cert: Option<Arc<CertInfo>> = None;
    if has_ssl || has_wss {
        if cert_path.is_some() != key_path.is_some() {
            return Err(bad_args("`cert` and `key` must both be specified"));
        }
        if wss_cert_path.is_some() != wss_key_path.is_some() {
            return Err(bad_args("`wss-cert` and `wss-key` must both be specified"));
        }
        if cert_path.is_none() && (has_ssl || wss_cert_path.is_none()) {
            let which = if has_ssl { "SSL" } else { "WSS" };
            return Err(bad_args(format!(
                "{which} option requires both -c/--cert and -k/--key options be specified"
            )));
        }
        if let (Some(cpath), Some(kpath)) = (&cert_path, &key_path) {
            cert = Some(Arc::new(load_cert_info(Path::new(cpath), Path::new(kpath))?));
        }
        if let (Some(cpath), Some(kpath)) = (&wss_cert_path, &wss_key_path) {
            wss_cert = Some(Arc::new(load_cert_info(
                Path::new(cpath),
                Path::new(kpath),
            )?));
        }
        if cert.is_none() {
            // Only WSS is configured; its pair stands in for cert/key.
            cert = wss_cert.take();
        }
    }
    if (wss_cert_path.is_some() || wss_key_path.is_some()) && !has_wss {
        return Err(bad_args(
            "wss-cert option specified but no WSS listening ports defined",
        ));
    }

    // Announced (public) ports default to the first bound port per transport;
    // `public_*_port = 0` clears them.
    let mut public_tcp_port = tcp_interfaces.first().map(|addr| addr.port());
    let mut public_ssl_port = ssl_interfaces.first().map(|addr| addr.port());
    let mut public_ws_port = ws_interfaces.first().map(|addr| addr.port());
    let mut public_wss_port = wss_interfaces.first().map(|addr| addr.port());
    let apply_public_port =
        |key: &str, slot: &mut Option<u16>| -> Result<(), OptionsError> {
            if let Some(raw) = conf.value(key) {
                let val = raw.trim().parse::<u32>().ok().filter(|v| *v <= u16::MAX as u32);
                match val {
                    Some(0) => *slot = None,
                    Some(port) => *slot = Some(port as u16),
                    None => {
                        return Err(bad_args(format!(
                            "{key} parse error: not an integer from 0 to 65535"
                        )))
                    }
                }
            }
            Ok(())
        };
    apply_public_port("public_tcp_port", &mut public_tcp_port)?;
    apply_public_port("public_ssl_port", &mut public_ssl_port)?;
    apply_public_port("public_ws_port", &mut public_ws_port)?;
    apply_public_port("public_wss_port", &mut public_wss_port)?;

    // Per-IP and subscription limits.
    let mut max_clients_per_ip = DEFAULT_MAX_CLIENTS_PER_IP;
    if let Some(raw) = conf.value("max_clients_per_ip") {
        max_clients_per_ip = raw.trim().parse::<usize>().map_err(|_| {
            bad_args(format!(
                "max_clients_per_ip parse error: cannot parse '{raw}' as an integer"
            ))
        })?;
        log_debug!(
            "config: max_clients_per_ip = {}",
            if max_clients_per_ip > 0 {
                max_clients_per_ip.to_string()
            } else {
                "Unlimited".to_string()
            }
        );
    }

    let mut subnets = Vec::new();
    if let Some(raw) = conf.value("subnets_to_exclude_from_per_ip_limits") {
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let subnet = Subnet::parse(part).ok_or_else(|| {
                bad_args(format!(
                    "subnets_to_exclude_from_per_ip_limits: Failed to parse {part}"
                ))
            })?;
            subnets.push(subnet);
        }
        log_debug!(
            "config: subnets_to_exclude_from_per_ip_limits = {}",
            if subnets.is_empty() {
                "None".to_string()
            } else {
                subnets
                    .iter()
                    .map(Subnet::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        );
    }

    let bounded_usize = |conf: &ConfFile,
                         key: &str,
                         min: usize,
                         max: usize,
                         default: usize|
     -> Result<usize, OptionsError> {
        match conf.value(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(v) if v >= min as i64 && v <= max as i64 => {
                    log_debug!("config: {key} = {v}");
                    Ok(v as usize)
                }
                _ => Err(bad_args(format!(
                    "{key}: bad value. Specify a value in the range [{min}, {max}]"
                ))),
            },
        }
    };

    let max_history = bounded_usize(
        &conf,
        "max_history",
        MAX_HISTORY_MIN,
        MAX_HISTORY_MAX,
        DEFAULT_MAX_HISTORY,
    )?;
    let max_buffer = bounded_usize(
        &conf,
        "max_buffer",
        MAX_BUFFER_MIN,
        MAX_BUFFER_MAX,
        DEFAULT_MAX_BUFFER,
    )?;
    let max_subs_per_ip = bounded_usize(
        &conf,
        "max_subs_per_ip",
        MAX_SUBS_PER_IP_MIN,
        MAX_SUBS_PER_IP_MAX,
        DEFAULT_MAX_SUBS_PER_IP,
    )?;
    let max_subs_globally = bounded_usize(
        &conf,
        "max_subs",
        MAX_SUBS_MIN,
        MAX_SUBS_MAX,
        DEFAULT_MAX_SUBS,
    )?;

    // Worker pool sizing.
    let mut work_queue = DEFAULT_WORK_QUEUE;
    if let Some(raw) = conf.value("workqueue") {
        match raw.trim().parse::<i64>() {
            Ok(v) if v >= MIN_WORK_QUEUE as i64 => {
                work_queue = v as usize;
                log_debug!("config: workqueue = {work_queue}");
            }
            _ => {
                return Err(bad_args(
                    "workqueue: bad value. Specify an integer >= 10",
                ))
            }
        }
    }
    let n_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut worker_threads = 0usize;
    if let Some(raw) = conf.value("worker_threads") {
        match raw.trim().parse::<i64>() {
            Ok(v) if v >= 0 => {
                if v as usize > n_cpus {
                    return Err(bad_args(format!(
                        "worker_threads: specified value of {v} exceeds the detected number of virtual processors of {n_cpus}"
                    )));
                }
                worker_threads = v as usize;
                log_debug!("config: worker_threads = {worker_threads}");
            }
            _ => {
                return Err(bad_args(
                    "worker_threads: bad value. Specify an integer >= 0",
                ))
            }
        }
    }
    let mut max_pending_connections = DEFAULT_MAX_PENDING_CONNECTIONS;
    if let Some(raw) = conf.value("max_pending_connections") {
        match raw.trim().parse::<i64>() {
            Ok(v)
                if v >= MIN_MAX_PENDING_CONNECTIONS as i64
                    && v <= MAX_MAX_PENDING_CONNECTIONS as i64 =>
            {
                max_pending_connections = v as u32;
                log_debug!("config: max_pending_connections = {max_pending_connections}");
            }
            _ => {
                return Err(bad_args(format!(
                    "max_pending_connections: Please specify an integer in the range [{MIN_MAX_PENDING_CONNECTIONS}, {MAX_MAX_PENDING_CONNECTIONS}]"
                )))
            }
        }
    }

    // bitcoind_throttle: three nonnegative integers, hi >= lo.
    let mut bitcoind_throttle = ThrottleParams::default();
    if let Some(raw) = conf.value("bitcoind_throttle") {
        let fields: Vec<&str> = raw
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .collect();
        let parsed: Option<ThrottleParams> = if fields.len() == 3 {
            let nums: Vec<u32> = fields.iter().filter_map(|s| s.parse().ok()).collect();
            (nums.len() == 3).then(|| ThrottleParams {
                hi: nums[0],
                lo: nums[1],
                decay: nums[2],
            })
        } else {
            None
        };
        match parsed {
            Some(p) if p.is_valid() => {
                bitcoind_throttle = p;
                log_debug!(
                    "config: bitcoind_throttle = (hi: {}, lo: {}, decay: {})",
                    p.hi,
                    p.lo,
                    p.decay
                );
            }
            _ => {
                return Err(bad_args(
                    "Failed to parse \"bitcoind_throttle\" -- out of range or invalid format. Please specify 3 positive integers in range.",
                ))
            }
        }
    }

    // Peering / identity.
    let hostname = conf.value("hostname").map(str::to_string);
    let peering = if conf.has("peering") {
        conf.bool_value("peering")
    } else {
        true
    };
    let announce = if conf.has("announce") {
        conf.bool_value("announce")
    } else {
        hostname.is_some() && peering
    };
    let peering_enforce_unique_ip = if conf.has("peering_enforce_unique_ip") {
        conf.bool_value("peering_enforce_unique_ip")
    } else {
        true
    };
    if hostname.is_none() && peering && announce {
        log_warn!(
            "No 'hostname' variable defined in configuration. This server may not be peer-discoverable."
        );
    }
    let donation_address = conf
        .value("donation")
        .map(|s| s.chars().take(80).collect())
        .unwrap_or_default();
    let banner_file = conf.value("banner").map(PathBuf::from);

    // Tor.
    let mut tor_hostname = None;
    if let Some(raw) = conf.value("tor_hostname") {
        let thn = raw.trim().to_ascii_lowercase();
        if !thn.is_empty() {
            if !thn.ends_with(".onion") {
                return Err(bad_args(format!(
                    "Bad tor_hostname specified: must end with .onion: {thn}"
                )));
            }
            log_debug!("config: tor_hostname = {thn}");
            tor_hostname = Some(thn);
        }
    }
    let tor_banner_file = conf.value("tor_banner").map(PathBuf::from);
    let tor_port = |key: &str| -> Result<Option<u16>, OptionsError> {
        match conf.value(key) {
            None => Ok(None),
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(0) => Ok(None),
                Ok(v) if v <= u16::MAX as u32 => {
                    log_debug!("config: {key} = {v}");
                    Ok(Some(v as u16))
                }
                _ => Err(bad_args(format!(
                    "{key} parse error: not an integer from 0 to 65535"
                ))),
            },
        }
    };
    let tor_tcp_port = tor_port("tor_tcp_port")?;
    let tor_ssl_port = tor_port("tor_ssl_port")?;
    let tor_ws_port = tor_port("tor_ws_port")?;
    let tor_wss_port = tor_port("tor_wss_port")?;
    let tor_proxy = match conf.value("tor_proxy") {
        None => None,
        Some(raw) => {
            let addr = parse_interface(raw, true).map_err(bad_args)?;
            log_debug!("config: tor_proxy = {addr}");
            Some(addr)
        }
    };
    // The original stored tor_pass into the tor_user field; they are distinct
    // credentials here.
    let tor_user = conf.value("tor_user").unwrap_or_default().to_string();
    let tor_pass = conf.value("tor_pass").unwrap_or_default().to_string();
    if !tor_user.is_empty() {
        log_debug!("config: tor_user = {tor_user}");
    }
    if !tor_pass.is_empty() {
        log_debug!("config: tor_pass = <hidden>");
    }

    // DB tuning knobs for the index backend.
    let mut db = DbOptions::default();
    if let Some(raw) = conf.value("db_max_open_files") {
        match raw.trim().parse::<i64>() {
            Ok(v) if v == -1 || (DB_MAX_OPEN_FILES_MIN..=DB_MAX_OPEN_FILES_MAX).contains(&v) => {
                db.max_open_files = v;
                log_debug!("config: db_max_open_files = {v}");
            }
            _ => {
                return Err(bad_args(format!(
                    "db_max_open_files: bad value. Specify a value in the range [{DB_MAX_OPEN_FILES_MIN}, {DB_MAX_OPEN_FILES_MAX}] or -1."
                )))
            }
        }
    }
    if let Some(raw) = conf.value("db_keep_log_file_num") {
        match raw.trim().parse::<i64>() {
            Ok(v) if (DB_KEEP_LOG_FILE_NUM_MIN..=DB_KEEP_LOG_FILE_NUM_MAX).contains(&v) => {
                db.keep_log_file_num = v as u32;
                log_debug!("config: db_keep_log_file_num = {v}");
            }
            _ => {
                return Err(bad_args(format!(
                    "db_keep_log_file_num: bad value. Specify a value in the range [{DB_KEEP_LOG_FILE_NUM_MIN}, {DB_KEEP_LOG_FILE_NUM_MAX}]"
                )))
            }
        }
    }

    // ts-format: CLI wins; conf accepts both spellings; syslog defaults to none.
    let ts_raw = cli
        .ts_format
        .clone()
        .or_else(|| conf.value("ts-format").map(str::to_string))
        .or_else(|| conf.value("ts_format").map(str::to_string));
    let ts_format = match ts_raw {
        Some(raw) => {
            let fmt = logging::TsFormat::parse(&raw)
                .ok_or_else(|| bad_args(format!("ts-format: unrecognized value \"{raw}\"")))?;
            log_debug!("config: ts-format = {}", fmt.as_str());
            fmt
        }
        None if syslog => {
            log_debug!("syslog mode enabled, defaulting to \"--ts-format none\"");
            logging::TsFormat::None
        }
        None => logging::TsFormat::Local,
    };

    let tls_disallow_deprecated =
        cli.tls_disallow_deprecated || conf.bool_value("tls-disallow-deprecated");
    if tls_disallow_deprecated {
        log_info!("TLS restricted to non-deprecated versions (version 1.2 or above)");
    }

    let dump_script_hashes = cli
        .dump_sh
        .take()
        .or_else(|| conf.value("dump-sh").map(str::to_string))
        .map(PathBuf::from);

    let unknown: Vec<&String> = {
        let known: HashSet<&str> = KNOWN_CONF_KEYS.iter().copied().collect();
        conf.keys().filter(|k| !known.contains(k.as_str())).collect()
    };
    if !unknown.is_empty() {
        let mut names: Vec<String> = unknown.iter().map(|s| s.to_string()).collect();
        names.sort();
        log_warn!(
            "Ignoring {} unsupported config {}: {}",
            names.len(),
            pluralize("key", names.len() as i64),
            names.join(", ")
        );
    }

    Ok(Options {
        datadir,
        bitcoind,
        bitcoind_tls,
        rpcuser,
        rpcpassword,
        poll_interval_secs,
        tcp_interfaces,
        ssl_interfaces,
        ws_interfaces,
        wss_interfaces,
        admin_interfaces,
        stats_interfaces,
        cert,
        wss_cert,
        public_tcp_port,
        public_ssl_port,
        public_ws_port,
        public_wss_port,
        max_clients_per_ip,
        subnets_excluded_from_per_ip_limits: subnets,
        max_subs_globally,
        max_subs_per_ip,
        max_history,
        max_buffer: AtomicUsize::new(max_buffer),
        work_queue,
        worker_threads,
        max_pending_connections,
        bitcoind_throttle,
        peering,
        announce,
        peering_enforce_unique_ip,
        hostname,
        donation_address,
        banner_file,
        tor_hostname,
        tor_banner_file,
        tor_tcp_port,
        tor_ssl_port,
        tor_ws_port,
        tor_wss_port,
        tor_proxy,
        tor_user,
        tor_pass,
        ts_format,
        syslog,
        tls_disallow_deprecated,
        dump_script_hashes,
        check_db,
        verbose_debug,
        verbose_trace,
        db,
    })
}

const KNOWN_CONF_KEYS: &[&str] = &[
    "admin",
    "announce",
    "banner",
    "bitcoind",
    "bitcoind-tls",
    "bitcoind_throttle",
    "cert",
    "checkdb",
    "datadir",
    "db_keep_log_file_num",
    "db_max_open_files",
    "debug",
    "donation",
    "dump-sh",
    "hostname",
    "key",
    "max_buffer",
    "max_clients_per_ip",
    "max_history",
    "max_pending_connections",
    "max_subs",
    "max_subs_per_ip",
    "peering",
    "peering_enforce_unique_ip",
    "polltime",
    "public_ssl_port",
    "public_tcp_port",
    "public_ws_port",
    "public_wss_port",
    "quiet",
    "rpcpassword",
    "rpcuser",
    "ssl",
    "stats",
    "subnets_to_exclude_from_per_ip_limits",
    "syslog",
    "tcp",
    "tls-disallow-deprecated",
    "tor_banner",
    "tor_hostname",
    "tor_pass",
    "tor_proxy",
    "tor_ssl_port",
    "tor_tcp_port",
    "tor_user",
    "tor_ws_port",
    "tor_wss_port",
    "ts-format",
    "ts_format",
    "workqueue",
    "worker_threads",
    "ws",
    "wss",
    "wss-cert",
    "wss-key",
];

/// Load and validate a certificate/key PEM pair. Key encodings are probed in
/// a fixed order (PKCS#1 RSA, SEC1 EC, PKCS#8); the first hit wins. A
/// CA-signed leaf without its chain in the same file is rejected.
pub fn load_cert_info(cert_path: &Path, key_path: &Path) -> Result<CertInfo, OptionsError> {
    if !cert_path.exists() {
        return Err(bad_args(format!(
            "Cert file not found: {}",
            cert_path.display()
        )));
    }
    if !key_path.exists() {
        return Err(bad_args(format!(
            "Key file not found: {}",
            key_path.display()
        )));
    }
    let cert_bytes = fs::read(cert_path).map_err(|err| {
        bad_args(format!(
            "Unable to open cert file {}: {err}",
            cert_path.display()
        ))
    })?;
    let key_bytes = fs::read(key_path).map_err(|err| {
        bad_args(format!(
            "Unable to open key file {}: {err}",
            key_path.display()
        ))
    })?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut Cursor::new(&cert_bytes))
            .collect::<Result<Vec<_>, _>>()
            .ok()
            .filter(|certs| !certs.is_empty())
            .ok_or_else(|| {
                bad_args(format!(
                    "Unable to read ssl certificate from {}. Please make sure the file is readable and contains a valid certificate in PEM format.",
                    cert_path.display()
                ))
            })?;

    let mut key: Option<(PrivateKeyDer<'static>, &'static str)> = None;
    if let Some(Ok(k)) = rustls_pemfile::rsa_private_keys(&mut Cursor::new(&key_bytes)).next() {
        key = Some((PrivateKeyDer::Pkcs1(k), "RSA"));
    }
    if key.is_none() {
        if let Some(Ok(k)) = rustls_pemfile::ec_private_keys(&mut Cursor::new(&key_bytes)).next() {
            key = Some((PrivateKeyDer::Sec1(k), "EC"));
        }
    }
    if key.is_none() {
        if let Some(Ok(k)) =
            rustls_pemfile::pkcs8_private_keys(&mut Cursor::new(&key_bytes)).next()
        {
            key = Some((PrivateKeyDer::Pkcs8(k), "PKCS#8"));
        }
    }
    let (key, key_algorithm) = key.ok_or_else(|| {
        bad_args(format!(
            "Unable to read private key from {}. Please make sure the file is readable and contains an RSA, EC, or PKCS#8 private key in PEM format.",
            key_path.display()
        ))
    })?;

    // A single non-self-signed certificate means the CA chain is missing.
    if certs.len() < 2 {
        if let Some(false) = cert_is_self_signed(certs[0].as_ref()) {
            return Err(bad_args(format!(
                "File '{}' does not appear to be a full certificate chain.\nPlease make sure your CA signed certificate is the fullchain.pem file.",
                cert_path.display()
            )));
        }
    }

    log_info!(
        "Loaded SSL certificate: {} ({} {} in chain)",
        cert_path.display(),
        certs.len(),
        pluralize("entry", certs.len() as i64)
    );
    log_info!("Loaded key type: private algorithm: {key_algorithm}");
    if key_algorithm != "RSA" {
        log_warn!(
            "{key_algorithm} key support is experimental. Please consider switching your SSL certificate and key to use 2048-bit RSA."
        );
    }

    Ok(CertInfo {
        certs,
        key,
        key_algorithm,
        cert_file: cert_path.to_path_buf(),
        key_file: key_path.to_path_buf(),
    })
}

// Minimal DER walk over an X.509 certificate: self-signed iff the issuer and
// subject Name elements are byte-identical. Returns None when the structure
// does not parse (the chain check is then skipped).
fn cert_is_self_signed(der: &[u8]) -> Option<bool> {
    fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8], &[u8])> {
        // -> (tag, value, whole_element, rest)
        if input.len() < 2 {
            return None;
        }
        let tag = input[0];
        let (len, header): (usize, usize) = match input[1] {
            n if n < 0x80 => (n as usize, 2),
            0x81 => (*input.get(2)? as usize, 3),
            0x82 => {
                let hi = *input.get(2)? as usize;
                let lo = *input.get(3)? as usize;
                (hi << 8 | lo, 4)
            }
            _ => return None,
        };
        let end = header.checked_add(len)?;
        if end > input.len() {
            return None;
        }
        Some((tag, &input[header..end], &input[..end], &input[end..]))
    }

    let (tag, cert_body, _, _) = read_tlv(der)?;
    if tag != 0x30 {
        return None;
    }
    let (tag, mut tbs, _, _) = read_tlv(cert_body)?;
    if tag != 0x30 {
        return None;
    }
    // [0] version (optional)
    if let Some((0xa0, _, _, rest)) = read_tlv(tbs) {
        tbs = rest;
    }
    // serialNumber
    let (tag, _, _, rest) = read_tlv(tbs)?;
    if tag != 0x02 {
        return None;
    }
    // signature AlgorithmIdentifier
    let (_, _, _, rest) = read_tlv(rest)?;
    // issuer Name
    let (_, _, issuer, rest) = read_tlv(rest)?;
    // validity
    let (_, _, _, rest) = read_tlv(rest)?;
    // subject Name
    let (_, _, subject, _) = read_tlv(rest)?;
    Some(issuer == subject)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_none() -> Env {
        Env {
            rpcuser: None,
            rpcpassword: None,
        }
    }

    fn base_args(extra: &[&str]) -> Vec<String> {
        let mut args = vec![
            "-D".to_string(),
            std::env::temp_dir()
                .join("lanternd-test-datadir")
                .display()
                .to_string(),
            "-b".to_string(),
            "127.0.0.1:8332".to_string(),
            "-u".to_string(),
            "user".to_string(),
            "-p".to_string(),
            "pass".to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }

    fn resolve_args(extra: &[&str]) -> Result<Options, OptionsError> {
        let cli = parse_cli(base_args(extra)).expect("cli parse");
        resolve(cli, ConfFile::default(), env_none())
    }

    fn resolve_with_conf(extra: &[&str], conf: &str) -> Result<Options, OptionsError> {
        let cli = parse_cli(base_args(extra)).expect("cli parse");
        resolve(cli, ConfFile::parse(conf), env_none())
    }

    #[test]
    fn conf_file_grammar() {
        let conf = ConfFile::parse(
            "# comment\n  tcp = 0.0.0.0:50001  \ntcp=0.0.0.0:60001\nfoo\n; other comment\nbar = baz # trailing\n",
        );
        assert_eq!(
            conf.values("tcp"),
            &["0.0.0.0:50001".to_string(), "0.0.0.0:60001".to_string()]
        );
        assert_eq!(conf.value("foo"), Some("1"));
        assert_eq!(conf.value("bar"), Some("baz"));
        assert!(!conf.has("comment"));
    }

    #[test]
    fn conf_bool_values() {
        for v in ["yes", "true", "on", "1", "", "2", "YES", "On"] {
            assert!(conf_bool(v), "{v:?} should be true");
        }
        for v in ["no", "false", "off", "0", "maybe"] {
            assert!(!conf_bool(v), "{v:?} should be false");
        }
    }

    #[test]
    fn cli_wins_over_conf() {
        let options = resolve_with_conf(
            &["-T", "3.5"],
            "polltime = 9.0\n",
        )
        .expect("resolve");
        assert_eq!(options.poll_interval_secs, 3.5);
    }

    #[test]
    fn polltime_bounds() {
        assert!(resolve_args(&["-T", "0.4"]).is_err());
        assert!(resolve_args(&["-T", "30.5"]).is_err());
        assert!(resolve_args(&["-T", "abc"]).is_err());
        let options = resolve_args(&["-T", "0.5"]).expect("resolve");
        assert_eq!(options.poll_interval_secs, 0.5);
        let options = resolve_args(&[]).expect("resolve");
        assert_eq!(options.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
    }

    #[test]
    fn required_option_missing() {
        let cli = parse_cli(vec!["-D".to_string(), "/tmp/x".to_string()]).expect("cli");
        let err = resolve(cli, ConfFile::default(), env_none()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("Required option missing or empty"), "{msg}");
    }

    #[test]
    fn rpc_credentials_fall_back_to_env() {
        let cli = parse_cli(vec![
            "-D".to_string(),
            std::env::temp_dir()
                .join("lanternd-test-datadir")
                .display()
                .to_string(),
            "-b".to_string(),
            "127.0.0.1:8332".to_string(),
        ])
        .expect("cli");
        let env = Env {
            rpcuser: Some("envuser".to_string()),
            rpcpassword: Some("envpass".to_string()),
        };
        let options = resolve(cli, ConfFile::default(), env).expect("resolve");
        assert_eq!(options.rpcuser, "envuser");
        assert_eq!(options.rpcpassword, "envpass");
    }

    #[test]
    fn default_tcp_listener_when_no_interfaces() {
        let options = resolve_args(&[]).expect("resolve");
        assert_eq!(
            options.tcp_interfaces,
            vec![SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT_TCP))]
        );
        let options = resolve_args(&["-w", "0.0.0.0:50003"]).expect("resolve");
        assert!(options.tcp_interfaces.is_empty());
        assert_eq!(options.ws_interfaces.len(), 1);
    }

    #[test]
    fn ssl_requires_cert_and_key() {
        let err = resolve_args(&["-s", "0.0.0.0:50002"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "SSL option requires both -c/--cert and -k/--key options be specified"
        );
    }

    #[test]
    fn wss_cert_without_wss_ports_is_rejected() {
        let err = resolve_with_conf(&[], "wss-cert = /nope.pem\nwss-key = /nope.key\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "wss-cert option specified but no WSS listening ports defined"
        );
    }

    #[test]
    fn bare_port_means_loopback_for_admin_and_stats() {
        let options = resolve_args(&["-a", "8000", "-z", "8001"]).expect("resolve");
        assert_eq!(
            options.admin_interfaces,
            vec!["127.0.0.1:8000".parse().unwrap()]
        );
        assert_eq!(
            options.stats_interfaces,
            vec!["127.0.0.1:8001".parse().unwrap()]
        );
        // bare ports are not accepted for client-facing transports
        let cli = parse_cli(base_args(&["-t", "50001"])).expect("cli");
        assert!(resolve(cli, ConfFile::default(), env_none()).is_err());
    }

    #[test]
    fn subnet_exemptions() {
        let options = resolve_with_conf(
            &[],
            "subnets_to_exclude_from_per_ip_limits = 10.0.0.0/8, 127.0.0.1\n",
        )
        .expect("resolve");
        assert_eq!(options.subnets_excluded_from_per_ip_limits.len(), 2);
        assert!(options.is_ip_exempt_from_per_ip_limits(&"10.1.2.3".parse().unwrap()));
        assert!(options.is_ip_exempt_from_per_ip_limits(&"127.0.0.1".parse().unwrap()));
        assert!(!options.is_ip_exempt_from_per_ip_limits(&"192.168.1.1".parse().unwrap()));
        assert!(resolve_with_conf(&[], "subnets_to_exclude_from_per_ip_limits = junk\n").is_err());
    }

    #[test]
    fn throttle_triple() {
        let options =
            resolve_with_conf(&[], "bitcoind_throttle = 100 50 10\n").expect("resolve");
        assert_eq!(
            options.bitcoind_throttle,
            ThrottleParams {
                hi: 100,
                lo: 50,
                decay: 10
            }
        );
        assert!(resolve_with_conf(&[], "bitcoind_throttle = 10 50 10\n").is_err());
        assert!(resolve_with_conf(&[], "bitcoind_throttle = 1 2\n").is_err());
    }

    #[test]
    fn tor_hostname_must_be_onion() {
        assert!(resolve_with_conf(&[], "tor_hostname = example.com\n").is_err());
        let options =
            resolve_with_conf(&[], "tor_hostname = AbCdEf.onion\n").expect("resolve");
        assert_eq!(options.tor_hostname.as_deref(), Some("abcdef.onion"));
    }

    #[test]
    fn tor_user_and_pass_are_distinct() {
        let options =
            resolve_with_conf(&[], "tor_user = alice\ntor_pass = hunter2\n").expect("resolve");
        assert_eq!(options.tor_user, "alice");
        assert_eq!(options.tor_pass, "hunter2");
    }

    #[test]
    fn tor_port_zero_clears() {
        let options = resolve_with_conf(&[], "tor_tcp_port = 0\n").expect("resolve");
        assert_eq!(options.tor_tcp_port, None);
        let options = resolve_with_conf(&[], "tor_tcp_port = 1234\n").expect("resolve");
        assert_eq!(options.tor_tcp_port, Some(1234));
    }

    #[test]
    fn public_port_zero_clears_announcement() {
        let options = resolve_args(&["-t", "0.0.0.0:50001"]).expect("resolve");
        assert_eq!(options.public_tcp_port, Some(50001));
        let options =
            resolve_with_conf(&["-t", "0.0.0.0:50001"], "public_tcp_port = 0\n").expect("resolve");
        assert_eq!(options.public_tcp_port, None);
        let options = resolve_with_conf(&["-t", "0.0.0.0:50001"], "public_tcp_port = 777\n")
            .expect("resolve");
        assert_eq!(options.public_tcp_port, Some(777));
    }

    #[test]
    fn workqueue_and_worker_threads_bounds() {
        assert!(resolve_with_conf(&[], "workqueue = 9\n").is_err());
        let options = resolve_with_conf(&[], "workqueue = 10\n").expect("resolve");
        assert_eq!(options.work_queue, 10);
        assert!(resolve_with_conf(&[], "worker_threads = 100000\n").is_err());
        let options = resolve_with_conf(&[], "worker_threads = 0\n").expect("resolve");
        assert_eq!(options.worker_threads, 0);
    }

    #[test]
    fn debug_twice_enables_trace() {
        let options = resolve_args(&["-d", "-d"]).expect("resolve");
        assert!(options.verbose_debug);
        assert!(options.verbose_trace);
        let options = resolve_args(&["-d"]).expect("resolve");
        assert!(options.verbose_debug);
        assert!(!options.verbose_trace);
        let options = resolve_args(&["-d", "-d", "-q"]).expect("resolve");
        assert!(!options.verbose_debug);
        assert!(!options.verbose_trace);
        let options = resolve_with_conf(&[], "debug = 1\ndebug = 1\n").expect("resolve");
        assert!(options.verbose_trace);
    }

    #[test]
    fn max_buffer_runtime_bounds() {
        let options = resolve_args(&[]).expect("resolve");
        assert_eq!(options.max_buffer(), DEFAULT_MAX_BUFFER);
        assert!(options.set_max_buffer(MAX_BUFFER_MIN as i64));
        assert_eq!(options.max_buffer(), MAX_BUFFER_MIN);
        assert!(!options.set_max_buffer(1));
        assert_eq!(options.max_buffer(), MAX_BUFFER_MIN);
    }

    #[test]
    fn self_test_action_short_circuits() {
        let action =
            parse_args_with_env(vec!["--test".to_string(), "json".to_string()], env_none())
                .expect("parse");
        match action {
            CliAction::SelfTest { tests, benches } => {
                assert_eq!(tests, vec!["json".to_string()]);
                assert!(benches.is_empty());
            }
            _ => panic!("expected SelfTest"),
        }
    }

    #[test]
    fn der_self_signed_walker() {
        // Minimal synthetic certificate: SEQ { SEQ { INTEGER 1, SEQ {},
        // issuer-SEQ, validity-SEQ, subject-SEQ } } with issuer == subject.
        let name: &[u8] = &[0x30, 0x03, 0x0c, 0x01, 0x41];
        let mut tbs = vec![0x02, 0x01, 0x01, 0x30, 0x00];
        tbs.extend_from_slice(name);
        tbs.extend_from_slice(&[0x30, 0x00]);
        tbs.extend_from_slice(name);
        let mut cert = vec![0x30, (tbs.len() + 2) as u8, 0x30, tbs.len() as u8];
        cert.extend_from_slice(&tbs);
        assert_eq!(cert_is_self_signed(&cert), Some(true));

        // Different subject.
        let other: &[u8] = &[0x30, 0x03, 0x0c, 0x01, 0x42];
        let mut tbs = vec![0x02, 0x01, 0x01, 0x30, 0x00];
        tbs.extend_from_slice(name);
        tbs.extend_from_slice(&[0x30, 0x00]);
        tbs.extend_from_slice(other);
        let mut cert = vec![0x30, (tbs.len() + 2) as u8, 0x30, tbs.len() as u8];
        cert.extend_from_slice(&tbs);
        assert_eq!(cert_is_self_signed(&cert), Some(false));

        assert_eq!(cert_is_self_signed(&[0x01, 0x02]), None);
    }
}
