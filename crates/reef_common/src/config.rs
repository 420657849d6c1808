use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReefError, ReefResult};

/// Default KV port for plain connections.
pub const DEFAULT_KV_PORT: u16 = 11210;
/// Default KV port when TLS is enabled.
pub const DEFAULT_KV_TLS_PORT: u16 = 11207;
/// Default cluster-manager HTTP port.
pub const DEFAULT_MGMT_PORT: u16 = 8091;

/// A bootstrap seed: one host to try during the initial config fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub host: String,
    /// KV port. None means the scheme default.
    pub kv_port: Option<u16>,
}

/// Top-level client configuration.
///
/// Built from a connection string plus credentials, or assembled directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bootstrap seed hosts.
    pub seeds: Vec<Seed>,
    /// Bucket to select after authentication. None skips SELECT_BUCKET.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Per-operation KV deadline when the caller does not supply one.
    #[serde(default = "default_kv_timeout", with = "duration_ms")]
    pub kv_timeout: Duration,
    /// Per-operation query-service deadline when the caller does not supply one.
    #[serde(default = "default_query_timeout", with = "duration_ms")]
    pub query_timeout: Duration,
    /// Bound on the TCP connect + handshake phase.
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Cap on the pool-lease wait inside an operation's deadline.
    #[serde(default = "default_acquire_timeout", with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Connections per data node (clamped to 1..=64).
    #[serde(default = "default_num_kv_connections")]
    pub num_kv_connections: usize,
    /// Requests in flight per connection before senders wait.
    #[serde(default = "default_max_pipelined")]
    pub max_pipelined: usize,
    /// Frames above this size are a protocol fault.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default = "default_true")]
    pub enable_mutation_tokens: bool,
    /// Negotiate snappy and compress outbound values above the threshold.
    #[serde(default = "default_true")]
    pub compression: bool,
    /// Minimum value size worth compressing, in bytes.
    #[serde(default = "default_compression_min_size")]
    pub compression_min_size: usize,
    /// Negotiate out-of-order responses on KV connections.
    #[serde(default)]
    pub unordered_execution: bool,
}

fn default_kv_timeout() -> Duration {
    Duration::from_millis(2_500)
}
fn default_query_timeout() -> Duration {
    Duration::from_millis(75_000)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_acquire_timeout() -> Duration {
    Duration::from_millis(2_500)
}
fn default_num_kv_connections() -> usize {
    2
}
fn default_max_pipelined() -> usize {
    128
}
fn default_max_frame_size() -> usize {
    20 * 1024 * 1024
}
fn default_compression_min_size() -> usize {
    32
}
fn default_true() -> bool {
    true
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: vec![Seed {
                host: "127.0.0.1".into(),
                kv_port: None,
            }],
            bucket: None,
            username: String::new(),
            password: String::new(),
            kv_timeout: default_kv_timeout(),
            query_timeout: default_query_timeout(),
            connect_timeout: default_connect_timeout(),
            acquire_timeout: default_acquire_timeout(),
            num_kv_connections: default_num_kv_connections(),
            max_pipelined: default_max_pipelined(),
            max_frame_size: default_max_frame_size(),
            enable_tls: false,
            enable_mutation_tokens: true,
            compression: true,
            compression_min_size: default_compression_min_size(),
            unordered_execution: false,
        }
    }
}

impl ClientConfig {
    /// Effective per-node connection count after clamping.
    pub fn kv_connections(&self) -> usize {
        self.num_kv_connections.clamp(1, 64)
    }

    /// KV port to dial on a seed before any cluster map is known.
    pub fn seed_kv_port(&self, seed: &Seed) -> u16 {
        seed.kv_port.unwrap_or(if self.enable_tls {
            DEFAULT_KV_TLS_PORT
        } else {
            DEFAULT_KV_PORT
        })
    }
}

/// A parsed connection string: `couchbase://host[,host…][:port][?opt=val]`.
///
/// Recognized options: `kv_timeout`, `query_timeout`, `num_kv_connections`,
/// `enable_tls`, `enable_mutation_tokens`, `compression` (all durations in
/// milliseconds). Unknown options are ignored with a warning so that newer
/// strings keep working against older clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub scheme: Scheme,
    pub seeds: Vec<Seed>,
    pub options: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Plain,
    Tls,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> ReefResult<Self> {
        let raw = raw.trim();
        let (scheme, rest) = match raw.split_once("://") {
            Some(("couchbase", rest)) => (Scheme::Plain, rest),
            Some(("couchbases", rest)) => (Scheme::Tls, rest),
            Some((other, _)) => {
                return Err(ReefError::InvalidConfig(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
            None => (Scheme::Plain, raw),
        };

        let (hosts_part, query_part) = match rest.split_once('?') {
            Some((h, q)) => (h, Some(q)),
            None => (rest, None),
        };
        if hosts_part.is_empty() {
            return Err(ReefError::InvalidConfig("no hosts in connection string".into()));
        }

        let mut seeds = Vec::new();
        for host in hosts_part.split(',') {
            let host = host.trim();
            if host.is_empty() {
                continue;
            }
            let (name, port) = match host.rsplit_once(':') {
                Some((name, port_str)) if !name.contains(':') => {
                    let port = port_str.parse::<u16>().map_err(|_| {
                        ReefError::InvalidConfig(format!("bad port in '{}'", host))
                    })?;
                    (name, Some(port))
                }
                // IPv6 literal or plain host.
                _ => (host, None),
            };
            seeds.push(Seed {
                host: name.to_string(),
                kv_port: port,
            });
        }
        if seeds.is_empty() {
            return Err(ReefError::InvalidConfig("no hosts in connection string".into()));
        }

        let mut options = Vec::new();
        if let Some(q) = query_part {
            for pair in q.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => options.push((k.to_string(), v.to_string())),
                    None => {
                        return Err(ReefError::InvalidConfig(format!(
                            "malformed option '{}'",
                            pair
                        )))
                    }
                }
            }
        }

        Ok(ConnectionString {
            scheme,
            seeds,
            options,
        })
    }

    /// Fold the parsed string into a config, applying recognized options.
    pub fn into_config(self) -> ReefResult<ClientConfig> {
        let mut cfg = ClientConfig {
            seeds: self.seeds,
            enable_tls: self.scheme == Scheme::Tls,
            ..ClientConfig::default()
        };
        for (key, value) in &self.options {
            match key.as_str() {
                "kv_timeout" => cfg.kv_timeout = Duration::from_millis(parse_u64(key, value)?),
                "query_timeout" => {
                    cfg.query_timeout = Duration::from_millis(parse_u64(key, value)?)
                }
                "num_kv_connections" => {
                    cfg.num_kv_connections = parse_u64(key, value)? as usize;
                    if !(1..=64).contains(&cfg.num_kv_connections) {
                        return Err(ReefError::InvalidConfig(format!(
                            "num_kv_connections must be in 1..=64, got {}",
                            cfg.num_kv_connections
                        )));
                    }
                }
                "enable_tls" => cfg.enable_tls = parse_bool(key, value)?,
                "enable_mutation_tokens" => {
                    cfg.enable_mutation_tokens = parse_bool(key, value)?
                }
                "compression" => cfg.compression = parse_bool(key, value)?,
                other => {
                    tracing::warn!(option = other, "ignoring unrecognized connection-string option");
                }
            }
        }
        Ok(cfg)
    }
}

fn parse_u64(key: &str, value: &str) -> ReefResult<u64> {
    value
        .parse::<u64>()
        .map_err(|_| ReefError::InvalidConfig(format!("option '{}' expects an integer, got '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> ReefResult<bool> {
    match value {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(ReefError::InvalidConfig(format!(
            "option '{}' expects a boolean, got '{}'",
            key, value
        ))),
    }
}
