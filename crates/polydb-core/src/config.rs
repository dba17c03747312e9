// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading for polydb.
//!
//! Two sources are combined at startup:
//!
//! - A declarative JSON topology file describing the SQL and KV clouds,
//!   with `${VAR}` substitution from the environment and
//!   `${SECRET:name:key}` substitution from mounted secret files.
//! - Environment variables for the execution store and timeout knobs
//!   ([`EnvSettings`]).

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Root of the mounted secret files used by `${SECRET:name:key}`.
const SECRETS_ROOT: &str = "/secrets";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder regex"));

/// Connection settings for one logical database on a SQL cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Logical name used by requests (e.g. `mydb`).
    pub name: String,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login role.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Physical database name.
    pub database: String,
    /// Schemas the operator UI may select.
    pub schemas: Vec<String>,
    /// Schema applied when the request does not name one.
    #[serde(rename = "defaultSchema")]
    pub default_schema: String,
}

/// A SQL cloud: a named cluster hosting one or more databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlCloudConfig {
    /// Cloud name used in requests and responses.
    #[serde(rename = "cloudName")]
    pub cloud_name: String,
    /// Databases reachable on this cloud.
    pub db_configs: Vec<DatabaseConfig>,
}

impl SqlCloudConfig {
    /// Look up a database by logical name.
    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.db_configs.iter().find(|db| db.name == name)
    }
}

/// A KV cloud: a cluster seed endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCloudConfig {
    /// Cloud name used in requests and responses.
    #[serde(rename = "cloudName")]
    pub cloud_name: String,
    /// Cluster seed host.
    pub host: String,
    /// Cluster seed port.
    pub port: u16,
}

/// Declared cloud topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// The primary SQL cloud.
    pub primary: SqlCloudConfig,
    /// Secondary SQL clouds (possibly empty).
    #[serde(default)]
    pub secondaries: Vec<SqlCloudConfig>,
    /// KV (cache) clouds.
    #[serde(default)]
    pub kv_clouds: Vec<KvCloudConfig>,
}

impl CloudConfig {
    /// Load and validate the topology from a JSON file, applying
    /// `${VAR}` and `${SECRET:name:key}` substitution first.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_str_with_secrets(&raw, Path::new(SECRETS_ROOT))
    }

    /// Parse the topology from raw JSON text with a custom secrets root.
    pub fn from_str_with_secrets(raw: &str, secrets_root: &Path) -> Result<Self> {
        let substituted = substitute(raw, secrets_root)?;
        let config: CloudConfig = serde_json::from_str(&substituted)?;
        config.validate()?;
        Ok(config)
    }

    /// All SQL clouds, primary first.
    pub fn sql_clouds(&self) -> impl Iterator<Item = &SqlCloudConfig> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    /// Look up a SQL cloud by name.
    pub fn sql_cloud(&self, name: &str) -> Option<&SqlCloudConfig> {
        self.sql_clouds().find(|c| c.cloud_name == name)
    }

    /// Look up a KV cloud by name.
    pub fn kv_cloud(&self, name: &str) -> Option<&KvCloudConfig> {
        self.kv_clouds.iter().find(|c| c.cloud_name == name)
    }

    fn validate(&self) -> Result<()> {
        for cloud in self.sql_clouds() {
            if cloud.cloud_name.is_empty() {
                return Err(CoreError::Config("cloudName must not be empty".into()));
            }
            if cloud.db_configs.is_empty() {
                return Err(CoreError::Config(format!(
                    "cloud '{}' declares no databases",
                    cloud.cloud_name
                )));
            }
            for db in &cloud.db_configs {
                for (field, value) in [
                    ("name", &db.name),
                    ("host", &db.host),
                    ("user", &db.user),
                    ("password", &db.password),
                    ("database", &db.database),
                    ("defaultSchema", &db.default_schema),
                ] {
                    if value.is_empty() {
                        return Err(CoreError::Config(format!(
                            "cloud '{}': database config field '{}' must not be empty",
                            cloud.cloud_name, field
                        )));
                    }
                }
                if db.schemas.is_empty() {
                    return Err(CoreError::Config(format!(
                        "cloud '{}' database '{}': schemas must not be empty",
                        cloud.cloud_name, db.name
                    )));
                }
            }
        }
        for kv in &self.kv_clouds {
            if kv.cloud_name.is_empty() || kv.host.is_empty() {
                return Err(CoreError::Config(
                    "kv cloud requires cloudName and host".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Replace `${VAR}` with the environment value and `${SECRET:name:key}`
/// with the contents of `<secrets_root>/<name>/<key>` (trimmed).
fn substitute(raw: &str, secrets_root: &Path) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(raw) {
        let whole = caps.get(0).expect("capture 0");
        let inner = &caps[1];
        out.push_str(&raw[last..whole.start()]);
        if let Some(rest) = inner.strip_prefix("SECRET:") {
            let (name, key) = rest.split_once(':').ok_or_else(|| {
                CoreError::Config(format!(
                    "malformed secret reference '${{{}}}' (expected ${{SECRET:name:key}})",
                    inner
                ))
            })?;
            let path = secrets_root.join(name).join(key);
            let value = std::fs::read_to_string(&path).map_err(|e| {
                CoreError::Config(format!("secret '{}' unreadable: {}", path.display(), e))
            })?;
            out.push_str(value.trim());
        } else {
            let value = std::env::var(inner).map_err(|_| {
                CoreError::Config(format!("environment variable '{}' is not set", inner))
            })?;
            out.push_str(&value);
        }
        last = whole.end();
    }
    out.push_str(&raw[last..]);
    Ok(out)
}

/// Execution store and timeout settings from the environment.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    /// Shared store host. `None` means no shared store is configured.
    pub redis_host: Option<String>,
    /// Shared store port.
    pub redis_port: u16,
    /// Use a cluster client for the shared store.
    pub redis_cluster_mode: bool,
    /// TTL of execution records in the shared store.
    pub execution_ttl: Duration,
    /// Upper bound on the request-supplied query timeout.
    pub max_query_timeout: Duration,
    /// Default per-statement timeout.
    pub statement_timeout: Duration,
    /// Session TTL handed to the auth layer.
    pub session_ttl: Option<Duration>,
}

impl EnvSettings {
    /// Read settings from the process environment.
    ///
    /// Recognised keys: `REDIS_HOST`, `REDIS_PORT`, `REDIS_CLUSTER_MODE`,
    /// `REDIS_EXECUTION_TTL_SECONDS` (default 300), `MAX_QUERY_TIMEOUT_MS`
    /// (default 300000), `STATEMENT_TIMEOUT_MS` (default 300000),
    /// `SESSION_TTL_SECONDS`.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis_host: std::env::var("REDIS_HOST").ok().filter(|h| !h.is_empty()),
            redis_port: parse_env("REDIS_PORT", 6379)?,
            redis_cluster_mode: std::env::var("REDIS_CLUSTER_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            execution_ttl: Duration::from_secs(parse_env("REDIS_EXECUTION_TTL_SECONDS", 300)?),
            max_query_timeout: Duration::from_millis(parse_env("MAX_QUERY_TIMEOUT_MS", 300_000)?),
            statement_timeout: Duration::from_millis(parse_env("STATEMENT_TIMEOUT_MS", 300_000)?),
            session_ttl: match std::env::var("SESSION_TTL_SECONDS") {
                Ok(v) => Some(Duration::from_secs(v.parse().map_err(|_| {
                    CoreError::Config("SESSION_TTL_SECONDS must be an integer".into())
                })?)),
                Err(_) => None,
            },
        })
    }

    /// Whether the shared store is a local development instance.
    ///
    /// Only in that case may the in-memory fallback tier be used.
    pub fn redis_is_local(&self) -> bool {
        matches!(
            self.redis_host.as_deref(),
            None | Some("localhost") | Some("127.0.0.1")
        )
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| CoreError::Config(format!("invalid value for {}", key))),
        Err(_) => Ok(default),
    }
}
