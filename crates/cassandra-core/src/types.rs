//! Domain types for the cluster configuration record set.
//!
//! Each type is persisted as its own record and served verbatim by the
//! API adapter. JSON field names are camelCase to stay compatible with
//! existing consumers, and optional fields are omitted when absent.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// Default Mesos failover timeout for the scheduler framework (one week).
pub const DEFAULT_FAILOVER_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Default JMX port exposed by each Cassandra node.
pub const DEFAULT_JMX_PORT: u16 = 7199;

static HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$",
    )
    .expect("hostname pattern compiles")
});

fn default_failover_timeout() -> u64 {
    DEFAULT_FAILOVER_TIMEOUT_SECS
}

fn default_checkpoint() -> bool {
    true
}

fn default_jmx_port() -> u16 {
    DEFAULT_JMX_PORT
}

fn require_non_empty(field: &'static str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty(field));
    }
    Ok(())
}

fn require_positive_cpus(field: &'static str, value: f64) -> ValidationResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ValidationError::NotPositive(field));
    }
    Ok(())
}

fn require_positive(field: &'static str, value: u64) -> ValidationResult<()> {
    if value == 0 {
        return Err(ValidationError::NotPositive(field));
    }
    Ok(())
}

/// Whether `addr` is a literal IP address or an RFC 1123 hostname.
pub fn is_host_address(addr: &str) -> bool {
    addr.parse::<IpAddr>().is_ok() || (addr.len() <= 253 && HOSTNAME.is_match(addr))
}

// ── Identity ──────────────────────────────────────────────────────

/// The scheduler framework's identity as registered with the cluster manager.
///
/// `id` is absent until the framework first registers; afterwards it is
/// fixed for the lifetime of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    pub principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "default_failover_timeout")]
    pub failover_timeout_secs: u64,
    #[serde(default = "default_checkpoint")]
    pub checkpoint: bool,
}

impl Identity {
    pub fn validate(&self) -> ValidationResult<()> {
        require_non_empty("identity.name", &self.name)?;
        if self.name.contains('/') {
            return Err(ValidationError::invalid(
                "identity.name",
                "must not contain '/'",
            ));
        }
        require_non_empty("identity.role", &self.role)?;
        require_non_empty("identity.principal", &self.principal)?;
        if let Some(id) = &self.id {
            require_non_empty("identity.id", id)?;
        }
        require_positive("identity.failoverTimeoutSecs", self.failover_timeout_secs)
    }

    /// Whether the framework has been assigned an id by the cluster manager.
    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }

    /// Copy of this identity carrying the given framework id.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..self.clone()
        }
    }
}

// ── Cassandra node ────────────────────────────────────────────────

/// Resource footprint and software version of each Cassandra node task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CassandraConfig {
    pub version: String,
    pub cpus: f64,
    pub memory_mb: u32,
    pub disk_mb: u32,
    #[serde(default = "default_jmx_port")]
    pub jmx_port: u16,
    /// Address of a failed node this node replaces. Omitted, never `null`,
    /// when there is nothing to replace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_ip: Option<String>,
}

impl CassandraConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        require_non_empty("cassandra.version", &self.version)?;
        semver::Version::parse(&self.version)
            .map_err(|e| ValidationError::invalid("cassandra.version", e.to_string()))?;
        require_positive_cpus("cassandra.cpus", self.cpus)?;
        require_positive("cassandra.memoryMb", self.memory_mb.into())?;
        require_positive("cassandra.diskMb", self.disk_mb.into())?;
        require_positive("cassandra.jmxPort", self.jmx_port.into())?;
        if let Some(addr) = &self.replace_ip {
            if !is_host_address(addr) {
                return Err(ValidationError::invalid(
                    "cassandra.replaceIp",
                    format!("{addr:?} is not a host address"),
                ));
            }
        }
        Ok(())
    }
}

// ── Executor ──────────────────────────────────────────────────────

/// Launch parameters for the per-node supervisory executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub cpus: f64,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub heap_mb: u32,
    pub api_port: u16,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_home: Option<String>,
}

impl ExecutorConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        require_non_empty("executor.command", &self.command)?;
        require_positive_cpus("executor.cpus", self.cpus)?;
        require_positive("executor.memoryMb", self.memory_mb.into())?;
        require_positive("executor.diskMb", self.disk_mb.into())?;
        require_positive("executor.heapMb", self.heap_mb.into())?;
        require_positive("executor.apiPort", self.api_port.into())?;
        if self.heap_mb > self.memory_mb {
            return Err(ValidationError::invalid(
                "executor.heapMb",
                format!(
                    "heap ({} MB) exceeds memory ({} MB)",
                    self.heap_mb, self.memory_mb
                ),
            ));
        }
        if self.uris.iter().any(|u| u.trim().is_empty()) {
            return Err(ValidationError::Empty("executor.uris[]"));
        }
        if let Some(home) = &self.java_home {
            require_non_empty("executor.javaHome", home)?;
        }
        Ok(())
    }
}

// ── Topology ──────────────────────────────────────────────────────

/// How many Cassandra tasks may share one cluster agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlacementStrategy {
    /// At most one node per agent.
    #[default]
    Node,
    /// Any agent with enough resources.
    Any,
}

impl PlacementStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementStrategy::Node => "NODE",
            PlacementStrategy::Any => "ANY",
        }
    }
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlacementStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NODE" => Ok(PlacementStrategy::Node),
            "ANY" => Ok(PlacementStrategy::Any),
            other => Err(ValidationError::invalid(
                "cluster.placement",
                format!("unknown placement strategy {other:?}"),
            )),
        }
    }
}

/// Desired shape of the Cassandra ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    pub servers: u32,
    pub seeds: u32,
    pub placement: PlacementStrategy,
    /// Endpoint new nodes query for the current seed list.
    pub seeds_url: String,
}

impl ClusterTopology {
    pub fn validate(&self) -> ValidationResult<()> {
        require_positive("cluster.servers", self.servers.into())?;
        if self.seeds > self.servers {
            return Err(ValidationError::invalid(
                "cluster.seeds",
                format!("{} seeds exceed {} servers", self.seeds, self.servers),
            ));
        }
        validate_seeds_url(&self.seeds_url)
    }
}

/// The seeds URL must be an absolute http(s) URL.
pub fn validate_seeds_url(url: &str) -> ValidationResult<()> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| ValidationError::invalid("cluster.seedsUrl", e.to_string()))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(ValidationError::invalid(
                "cluster.seedsUrl",
                format!("{url:?} is not an http(s) URL"),
            ));
        }
    }
    if uri.authority().is_none() {
        return Err(ValidationError::invalid(
            "cluster.seedsUrl",
            format!("{url:?} has no host"),
        ));
    }
    Ok(())
}

// ── Aggregate ─────────────────────────────────────────────────────

/// The full configuration record set for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfiguration {
    pub identity: Identity,
    pub cassandra: CassandraConfig,
    pub executor: ExecutorConfig,
    pub topology: ClusterTopology,
}

impl ClusterConfiguration {
    pub fn validate(&self) -> ValidationResult<()> {
        self.identity.validate()?;
        self.cassandra.validate()?;
        self.executor.validate()?;
        self.topology.validate()
    }
}
