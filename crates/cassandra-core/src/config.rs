//! scheduler.toml configuration parser.
//!
//! The bootstrap file supplies the defaults the configuration manager
//! persists on first start, plus the store and API settings. Values may
//! reference environment variables as `${VAR}` or `${VAR:-fallback}`.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::types::*;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env pattern compiles")
});

pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 250;
pub const DEFAULT_API_PORT: u16 = 9000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub identity: IdentitySection,
    pub cassandra: CassandraSection,
    pub executor: ExecutorSection,
    pub cluster: ClusterSection,
    pub store: StoreConfig,
    pub api: Option<ApiSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySection {
    pub name: String,
    pub role: String,
    pub principal: String,
    pub secret: Option<String>,
    pub failover_timeout_secs: Option<u64>,
    pub checkpoint: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CassandraSection {
    pub version: String,
    pub cpus: f64,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub jmx_port: Option<u16>,
    /// An empty string (e.g. from `${REPLACE_IP:-}`) means no replacement.
    pub replace_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    pub command: String,
    pub arguments: Option<Vec<String>>,
    pub cpus: f64,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub heap_mb: u32,
    pub api_port: u16,
    pub uris: Option<Vec<String>>,
    pub java_home: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    pub servers: u32,
    pub seeds: u32,
    pub placement: Option<String>,
    pub seeds_url: String,
}

/// Connection settings for the consensus store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    pub session_timeout_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub operation_timeout_ms: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    /// Path prefix under which every record key lives.
    pub root_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    pub port: Option<u16>,
}

impl StoreConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms.unwrap_or(DEFAULT_SESSION_TIMEOUT_MS))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(
            self.connection_timeout_ms
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS),
        )
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(
            self.operation_timeout_ms
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS),
        )
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS))
    }
}

/// Replace `${VAR}` / `${VAR:-fallback}` references using `lookup`.
///
/// A variable that is unset and has no fallback is an error. Comments are
/// copied through untouched.
pub fn substitute_env<F>(input: &str, lookup: F) -> anyhow::Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let mut output = String::with_capacity(input.len());
    for line in input.split_inclusive('\n') {
        let (code, comment) = line.split_at(comment_start(line).unwrap_or(line.len()));
        let replaced = ENV_REFERENCE.replace_all(code, |caps: &Captures<'_>| {
            let name = &caps[1];
            match (lookup(name), caps.get(2)) {
                (Some(value), _) => value,
                (None, Some(fallback)) => fallback.as_str().to_string(),
                (None, None) => {
                    missing.push(name.to_string());
                    String::new()
                }
            }
        });
        output.push_str(&replaced);
        output.push_str(comment);
    }
    if !missing.is_empty() {
        anyhow::bail!("undefined environment variables: {}", missing.join(", "));
    }
    Ok(output)
}

/// Byte offset of the `#` opening a comment on `line`, skipping any `#`
/// inside a quoted string.
fn comment_start(line: &str) -> Option<usize> {
    let mut quote = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match quote {
            Some('"') if escaped => escaped = false,
            Some('"') if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '#' => return Some(i),
            None => {}
        }
    }
    None
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, |name| std::env::var(name).ok())
    }

    /// Parse a TOML document after environment substitution.
    pub fn parse<F>(content: &str, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let substituted = substitute_env(content, lookup)?;
        let config: SchedulerConfig = toml::from_str(&substituted)?;
        Ok(config)
    }

    pub fn api_port(&self) -> u16 {
        self.api
            .as_ref()
            .and_then(|api| api.port)
            .unwrap_or(DEFAULT_API_PORT)
    }

    /// Build and validate the configuration defaults handed to the manager.
    pub fn defaults(&self) -> anyhow::Result<ClusterConfiguration> {
        let identity = Identity {
            name: self.identity.name.clone(),
            id: None,
            role: self.identity.role.clone(),
            principal: self.identity.principal.clone(),
            secret: non_blank(self.identity.secret.as_deref()),
            failover_timeout_secs: self
                .identity
                .failover_timeout_secs
                .unwrap_or(DEFAULT_FAILOVER_TIMEOUT_SECS),
            checkpoint: self.identity.checkpoint.unwrap_or(true),
        };

        let cassandra = CassandraConfig {
            version: self.cassandra.version.clone(),
            cpus: self.cassandra.cpus,
            memory_mb: self.cassandra.memory_mb,
            disk_mb: self.cassandra.disk_mb,
            jmx_port: self.cassandra.jmx_port.unwrap_or(DEFAULT_JMX_PORT),
            replace_ip: non_blank(self.cassandra.replace_ip.as_deref()),
        };

        let executor = ExecutorConfig {
            command: self.executor.command.clone(),
            arguments: self.executor.arguments.clone().unwrap_or_default(),
            cpus: self.executor.cpus,
            memory_mb: self.executor.memory_mb,
            disk_mb: self.executor.disk_mb,
            heap_mb: self.executor.heap_mb,
            api_port: self.executor.api_port,
            uris: self.executor.uris.clone().unwrap_or_default(),
            java_home: non_blank(self.executor.java_home.as_deref()),
        };

        let placement = match self.cluster.placement.as_deref() {
            Some(name) => name.parse()?,
            None => PlacementStrategy::default(),
        };

        let topology = ClusterTopology {
            servers: self.cluster.servers,
            seeds: self.cluster.seeds,
            placement,
            seeds_url: self.cluster.seeds_url.clone(),
        };

        let config = ClusterConfiguration {
            identity,
            cassandra,
            executor,
            topology,
        };
        config.validate()?;
        Ok(config)
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
