//! Pool configuration: a YAML map of pool name to pool settings.
//!
//! ```yaml
//! alpha:
//!   listen: 127.0.0.1:22121
//!   hash: fnv1a_64
//!   distribution: ketama
//!   auto_eject_hosts: true
//!   server_retry_timeout: 30000
//!   server_failure_limit: 2
//!   servers:
//!     - 127.0.0.1:11211:1
//!     - 127.0.0.1:11212:1 backup
//! ```

use crate::error::Error;
use hashkit::{Distribution, Hash};
use proto::Protocol;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

fn default_backlog() -> u32 {
    512
}

fn default_server_connections() -> usize {
    1
}

fn default_server_retry_timeout() -> u64 {
    30_000
}

fn default_server_failure_limit() -> u32 {
    2
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConf {
    pub listen: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub hash_tag: Option<String>,
    #[serde(default)]
    pub distribution: Option<String>,
    /// Per-request deadline in milliseconds; absent means wait forever.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub client_connections: usize,
    #[serde(default)]
    pub redis: bool,
    /// Injects `SELECT <db>` on every fresh server connection.
    #[serde(default)]
    pub redis_db: Option<u32>,
    #[serde(default)]
    pub preconnect: bool,
    #[serde(default)]
    pub auto_eject_hosts: bool,
    #[serde(default = "default_server_connections")]
    pub server_connections: usize,
    /// Milliseconds before an ejected server is retried.
    #[serde(default = "default_server_retry_timeout")]
    pub server_retry_timeout: u64,
    #[serde(default = "default_server_failure_limit")]
    pub server_failure_limit: u32,
    pub servers: Vec<String>,
}

/// Where a pool listens for clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    Tcp(String),
    Unix(PathBuf),
}

impl std::fmt::Display for Listen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Listen::Tcp(addr) => write!(f, "{addr}"),
            Listen::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One backend endpoint: `host:port:weight` with an optional trailing name.
/// The name, defaulting to `host:port`, identifies the server on the ketama
/// continuum and in stats output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConf {
    pub addr: String,
    pub weight: u32,
    pub name: String,
}

impl ServerConf {
    fn parse(line: &str) -> Result<ServerConf, String> {
        let (endpoint, name) = match line.split_once(' ') {
            Some((endpoint, name)) if !name.trim().is_empty() => {
                (endpoint, Some(name.trim().to_string()))
            }
            Some((endpoint, _)) => (endpoint, None),
            None => (line, None),
        };

        let mut parts = endpoint.rsplitn(2, ':');
        let weight_str = parts.next().ok_or("missing weight")?;
        let addr = parts.next().ok_or("expected host:port:weight")?;
        if !addr.contains(':') {
            return Err("expected host:port:weight".to_string());
        }
        let weight: u32 = weight_str
            .parse()
            .map_err(|_| format!("invalid weight {weight_str:?}"))?;
        if weight == 0 {
            return Err("weight must be positive".to_string());
        }

        Ok(ServerConf {
            addr: addr.to_string(),
            weight,
            name: name.unwrap_or_else(|| addr.to_string()),
        })
    }
}

/// A validated pool definition, ready to build a server pool from.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub name: String,
    pub listen: Listen,
    pub hash: Hash,
    pub hash_tag: Option<(u8, u8)>,
    pub distribution: Distribution,
    pub timeout: Option<Duration>,
    pub backlog: u32,
    pub client_connections: usize,
    pub protocol: Protocol,
    pub redis_db: Option<u32>,
    pub preconnect: bool,
    pub auto_eject_hosts: bool,
    pub server_connections: usize,
    pub server_retry_timeout: Duration,
    pub server_failure_limit: u32,
    pub servers: Vec<ServerConf>,
    /// Read-buffer growth granularity, set process-wide from the CLI.
    pub chunk_size: usize,
}

impl PoolConf {
    pub fn validate(&self, name: &str, chunk_size: usize) -> Result<PoolSettings, Error> {
        let fail = |msg: String| Error::Config(format!("pool {name:?}: {msg}"));

        let hash = match &self.hash {
            None => Hash::default(),
            Some(s) => s.parse().map_err(|e| fail(format!("{e}")))?,
        };
        let distribution = match &self.distribution {
            None => Distribution::default(),
            Some(s) => s.parse().map_err(|e| fail(format!("{e}")))?,
        };

        let hash_tag = match &self.hash_tag {
            None => None,
            Some(tag) => {
                let bytes = tag.as_bytes();
                if bytes.len() != 2 {
                    return Err(fail(format!(
                        "hash_tag must be exactly two characters, got {tag:?}"
                    )));
                }
                Some((bytes[0], bytes[1]))
            }
        };

        if self.servers.is_empty() {
            return Err(fail("no servers configured".to_string()));
        }
        let servers = self
            .servers
            .iter()
            .map(|line| ServerConf::parse(line).map_err(|e| fail(format!("{line:?}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;

        if self.server_connections == 0 {
            return Err(fail("server_connections must be at least 1".to_string()));
        }
        if self.redis_db.is_some() && !self.redis {
            return Err(fail("redis_db requires redis: true".to_string()));
        }

        let listen = if self.listen.starts_with('/') {
            Listen::Unix(PathBuf::from(&self.listen))
        } else {
            Listen::Tcp(self.listen.clone())
        };

        Ok(PoolSettings {
            name: name.to_string(),
            listen,
            hash,
            hash_tag,
            distribution,
            timeout: self.timeout.map(Duration::from_millis),
            backlog: self.backlog,
            client_connections: self.client_connections,
            protocol: if self.redis {
                Protocol::Redis
            } else {
                Protocol::Memcache
            },
            redis_db: self.redis_db,
            preconnect: self.preconnect,
            auto_eject_hosts: self.auto_eject_hosts,
            server_connections: self.server_connections,
            server_retry_timeout: Duration::from_millis(self.server_retry_timeout),
            server_failure_limit: self.server_failure_limit,
            servers,
            chunk_size,
        })
    }
}

/// Parse and validate a whole configuration file.
pub fn load(contents: &str, chunk_size: usize) -> Result<Vec<PoolSettings>, Error> {
    let pools: BTreeMap<String, PoolConf> =
        serde_yaml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
    if pools.is_empty() {
        return Err(Error::Config("no pools configured".to_string()));
    }
    pools
        .iter()
        .map(|(name, conf)| conf.validate(name, chunk_size))
        .collect()
}
