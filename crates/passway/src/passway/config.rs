use std::{net::SocketAddr, path::PathBuf, time::Duration};

use url::Url;

use crate::passway::endpoint::{self, Endpoints};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("config: mode {0:?} is not supported by this build (only client)")]
    UnsupportedMode(String),
    #[error("config: unknown mode {0:?} (expected server|client|master)")]
    UnknownMode(String),
    #[error("config: invalid {what} address {addr:?}: {reason}")]
    Endpoint {
        what: &'static str,
        addr: String,
        reason: &'static str,
    },
    #[error("config: invalid option {key}={value:?}: {reason}")]
    Option {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
    Master,
}

impl Mode {
    fn parse(scheme: &str) -> Result<Self, ConfigError> {
        match scheme.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Mode::Server),
            "client" => Ok(Mode::Client),
            "master" => Ok(Mode::Master),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

/// How the tunnel peer's certificate is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertVerification {
    /// Verify against the bundled web PKI roots, plus an optional PEM bundle.
    Verify { ca_file: Option<PathBuf> },
    /// Accept any certificate. Opt-in only (`insecure=1`).
    Insecure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub verification: CertVerification,
    /// SNI / verification name; defaults to the tunnel host.
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verification: CertVerification::Verify { ca_file: None },
            server_name: None,
        }
    }
}

/// What the control-channel reader does when the signal queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Drop the arriving signal; never stall the reader.
    DropNewest,
    /// Wait for queue space, pushing back on the peer.
    Block,
}

#[derive(Debug, Clone)]
pub struct Tunables {
    pub signal_queue: usize,
    pub drop_policy: DropPolicy,
    pub min_pool: usize,
    pub max_pool: usize,
    pub pool_interval: Duration,
    pub udp_buffer_size: usize,
    pub udp_read_timeout: Duration,
    pub dial_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Prometheus scrape listener; metrics are not exported when unset.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            signal_queue: 1024,
            drop_policy: DropPolicy::DropNewest,
            min_pool: 16,
            max_pool: 1024,
            pool_interval: Duration::from_secs(1),
            udp_buffer_size: 8192,
            udp_read_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            metrics_addr: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub endpoints: Endpoints,
    pub logging: LoggingConfig,
    pub tls: TlsConfig,
    pub tunables: Tunables,
    /// Query keys accepted but not used in client mode (reported after logging starts).
    pub ignored_options: Vec<String>,
}

pub fn load_config(raw_url: &str) -> Result<Config, ConfigError> {
    load_config_with_env(raw_url, |key| std::env::var(key).ok())
}

pub fn load_config_with_env<F>(raw_url: &str, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let url = Url::parse(raw_url.trim())?;
    let mode = Mode::parse(url.scheme())?;
    if mode != Mode::Client {
        return Err(ConfigError::UnsupportedMode(url.scheme().to_string()));
    }

    let endpoints = endpoint::resolve(&url)?;

    let mut logging = LoggingConfig::default();
    let mut tls = TlsConfig::default();
    let mut insecure = false;
    let mut ca_file = None;
    let mut ignored_options = Vec::new();

    for (key, value) in url.query_pairs() {
        let value = value.trim();
        match key.as_ref() {
            "log" => logging.level = parse_level(value)?,
            "log_format" => {
                logging.format = match value.to_ascii_lowercase().as_str() {
                    "text" | "" => "text".into(),
                    "json" => "json".into(),
                    _ => return Err(bad_option("log_format", value, "expected text|json")),
                }
            }
            "log_output" => {
                if value.is_empty() {
                    return Err(bad_option("log_output", value, "empty output"));
                }
                logging.output = value.to_string();
            }
            "log_source" => logging.add_source = parse_flag("log_source", value)?,
            "insecure" => insecure = parse_flag("insecure", value)?,
            "ca" => {
                if !value.is_empty() {
                    ca_file = Some(PathBuf::from(value));
                }
            }
            "sni" => {
                if !value.is_empty() {
                    tls.server_name = Some(value.to_string());
                }
            }
            other => ignored_options.push(other.to_string()),
        }
    }

    tls.verification = if insecure {
        if ca_file.is_some() {
            ignored_options.push("ca".into());
        }
        CertVerification::Insecure
    } else {
        CertVerification::Verify { ca_file }
    };

    let tunables = tunables_from_env(&env)?;

    Ok(Config {
        mode,
        endpoints,
        logging,
        tls,
        tunables,
        ignored_options,
    })
}

fn tunables_from_env<F>(env: &F) -> Result<Tunables, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let d = Tunables::default();

    let drop_policy = match env("PASSWAY_SIGNAL_DROP") {
        None => d.drop_policy,
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "" | "newest" | "drop-newest" => DropPolicy::DropNewest,
            "block" => DropPolicy::Block,
            _ => {
                return Err(bad_option(
                    "PASSWAY_SIGNAL_DROP",
                    &v,
                    "expected newest|block",
                ));
            }
        },
    };

    let min_pool = env_usize(env, "PASSWAY_MIN_POOL", d.min_pool)?;
    let max_pool = env_usize(env, "PASSWAY_MAX_POOL", d.max_pool)?.max(min_pool);

    Ok(Tunables {
        signal_queue: env_usize(env, "PASSWAY_SIGNAL_QUEUE", d.signal_queue)?,
        drop_policy,
        min_pool,
        max_pool,
        pool_interval: env_duration(env, "PASSWAY_POOL_INTERVAL", d.pool_interval)?,
        udp_buffer_size: env_usize(env, "PASSWAY_UDP_BUFFER", d.udp_buffer_size)?,
        udp_read_timeout: env_duration(env, "PASSWAY_UDP_TIMEOUT", d.udp_read_timeout)?,
        dial_timeout: env_duration(env, "PASSWAY_DIAL_TIMEOUT", d.dial_timeout)?,
        shutdown_grace: env_duration(env, "PASSWAY_SHUTDOWN_GRACE", d.shutdown_grace)?,
        metrics_addr: env_socket_addr(env, "PASSWAY_METRICS_ADDR")?,
    })
}

fn env_socket_addr<F>(env: &F, key: &str) -> Result<Option<SocketAddr>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match env(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err: std::net::AddrParseError| bad_option(key, &raw, &err.to_string())),
    }
}

fn env_usize<F>(env: &F, key: &str, default: usize) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(bad_option(key, &raw, "must be at least 1")),
        Ok(n) => Ok(n),
        Err(err) => Err(bad_option(key, &raw, &err.to_string())),
    }
}

fn env_duration<F>(env: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = env(key) else {
        return Ok(default);
    };
    match humantime::parse_duration(raw.trim()) {
        Ok(d) if d.is_zero() => Err(bad_option(key, &raw, "must be non-zero")),
        Ok(d) => Ok(d),
        Err(err) => Err(bad_option(key, &raw, &err.to_string())),
    }
}

fn parse_level(value: &str) -> Result<String, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "" | "info" => Ok("info".into()),
        "debug" => Ok("debug".into()),
        "warn" => Ok("warn".into()),
        "error" | "fatal" => Ok("error".into()),
        _ => Err(bad_option("log", value, "expected debug|info|warn|error|fatal")),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(bad_option(key, value, "expected 0|1")),
    }
}

fn bad_option(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Option {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
