//! Process configuration
//!
//! Loaded once at startup from `~/.replimesh/config.toml` (or `--config`,
//! or `REPLIMESH_CONFIG`). String values may reference environment variables
//! as `${NAME}` so connection URLs and tokens stay out of the file.
//!
//! ```toml
//! diagnostics = false
//!
//! [database]
//! name = "siasis_asuncion_8"
//! max_pool_size = 10
//!
//! [instances]
//! ins1 = "${RDP03_INS1_URL}"
//!
//! [roles]
//! director = ["ins1", "ins2"]
//!
//! [replication]
//! enabled = true
//! owner = "${REPLICATION_REPOSITORY_OWNER}"
//! repository = "${REPLICATION_REPOSITORY_NAME}"
//! token = "${REPLICATION_TOKEN}"
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MeshError, Result};
use crate::role::Role;

pub const DEFAULT_DATABASE_NAME: &str = "siasis_asuncion_8";
pub const DEFAULT_EVENT_TYPE: &str = "mongodb-replication";
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

/// Environment value that turns on per-operation diagnostic records
const DIAGNOSTIC_ENV_VALUE: &str = "D";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Emit a structured record for every executed operation
    #[serde(default)]
    pub diagnostics: bool,
    #[serde(default)]
    pub database: PoolConfig,
    /// instance id -> connection URL
    #[serde(default)]
    pub instances: BTreeMap<String, String>,
    /// role name or code -> instance ids
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

/// Connection pool and timeout settings applied to every instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub name: String,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    pub max_idle_time_ms: u64,
    pub server_selection_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_frequency_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DATABASE_NAME.to_string(),
            max_pool_size: 10,
            min_pool_size: 2,
            max_idle_time_ms: 30_000,
            server_selection_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            heartbeat_frequency_ms: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }
}

/// External replication channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub enabled: bool,
    pub owner: String,
    pub repository: String,
    pub token: String,
    pub event_type: String,
    pub api_base: String,
    pub timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            owner: String::new(),
            repository: String::new(),
            token: String::new(),
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl ReplicationConfig {
    /// `POST` target for repository dispatch events
    pub fn dispatch_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/dispatches",
            self.api_base.trim_end_matches('/'),
            self.owner,
            self.repository
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl MeshConfig {
    /// Load config from an explicit path, `REPLIMESH_CONFIG`, or the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path(),
        };

        if !path.exists() {
            return Err(MeshError::config(format!(
                "config not found at {:?}\n\nCreate one or pass --config",
                path
            )));
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| MeshError::config(format!("failed to read {:?}: {}", path, e)))?;

        Self::from_toml_str(&content)
    }

    /// Get config file path: `$REPLIMESH_CONFIG` or `~/.replimesh/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = env::var("REPLIMESH_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".replimesh/config.toml")
    }

    /// Parse TOML, expand `${VAR}` references and validate
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| MeshError::config(format!("invalid TOML: {}", e)))?;

        config.expand_variables(|name| env::var(name).ok());
        config.apply_environment_flags();
        config.validate()?;
        Ok(config)
    }

    /// Build configuration purely from environment variables.
    ///
    /// - `REPLIMESH_INSTANCE_<ID>_URL` defines an instance (id lowercased)
    /// - `REPLIMESH_ROLE_<CODE>_INSTANCES` is a comma-separated instance list
    /// - `MONGO_MAX_POOL_SIZE`, `MONGO_MIN_POOL_SIZE`,
    ///   `MONGO_SERVER_SELECTION_TIMEOUT`, `MONGO_CONNECTION_TIMEOUT` tune the pool
    /// - `REPLICATION_REPOSITORY_OWNER`, `REPLICATION_REPOSITORY_NAME`,
    ///   `REPLICATION_TOKEN` enable the replication channel
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_vars(env::vars())?;
        config.apply_environment_flags();
        config.validate()?;
        Ok(config)
    }

    /// Same as [`MeshConfig::from_env`] over an explicit variable set, without validation
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();

        for (key, value) in vars {
            if let Some(id) = key
                .strip_prefix("REPLIMESH_INSTANCE_")
                .and_then(|rest| rest.strip_suffix("_URL"))
            {
                config.instances.insert(id.to_lowercase(), value);
            } else if let Some(code) = key
                .strip_prefix("REPLIMESH_ROLE_")
                .and_then(|rest| rest.strip_suffix("_INSTANCES"))
            {
                let role: Role = code.parse()?;
                let ids = value
                    .split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                config.roles.insert(role.name().to_string(), ids);
            } else {
                match key.as_str() {
                    "MONGO_MAX_POOL_SIZE" => config.database.max_pool_size = parse_num(&key, &value)?,
                    "MONGO_MIN_POOL_SIZE" => config.database.min_pool_size = parse_num(&key, &value)?,
                    "MONGO_SERVER_SELECTION_TIMEOUT" => {
                        config.database.server_selection_timeout_ms = parse_num(&key, &value)?
                    }
                    "MONGO_CONNECTION_TIMEOUT" => {
                        config.database.connect_timeout_ms = parse_num(&key, &value)?
                    }
                    "REPLIMESH_DATABASE_NAME" => config.database.name = value,
                    "REPLICATION_REPOSITORY_OWNER" => config.replication.owner = value,
                    "REPLICATION_REPOSITORY_NAME" => config.replication.repository = value,
                    "REPLICATION_TOKEN" => config.replication.token = value,
                    "REPLIMESH_ENV" => config.diagnostics = value == DIAGNOSTIC_ENV_VALUE,
                    _ => {}
                }
            }
        }

        config.replication.enabled = !config.replication.owner.is_empty()
            && !config.replication.repository.is_empty()
            && !config.replication.token.is_empty();

        Ok(config)
    }

    fn apply_environment_flags(&mut self) {
        if env::var("REPLIMESH_ENV").as_deref() == Ok(DIAGNOSTIC_ENV_VALUE) {
            self.diagnostics = true;
        }
    }

    /// Expand `${NAME}` references in URLs and replication credentials
    pub fn expand_variables(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for url in self.instances.values_mut() {
            *url = expand_string(url, &lookup);
        }
        let replication = &mut self.replication;
        replication.owner = expand_string(&replication.owner, &lookup);
        replication.repository = expand_string(&replication.repository, &lookup);
        replication.token = expand_string(&replication.token, &lookup);
        replication.api_base = expand_string(&replication.api_base, &lookup);
    }

    /// Parsed role map, in config key order
    pub fn role_assignments(&self) -> Result<Vec<(Role, Vec<String>)>> {
        self.roles
            .iter()
            .map(|(key, ids)| Ok((key.parse::<Role>()?, ids.clone())))
            .collect()
    }

    /// Check structural invariants. Instances referenced by a role but lacking a
    /// URL only warn: they fail later with `NoConnectionUrl`.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        let mut seen_roles = Vec::new();
        for (key, ids) in &self.roles {
            match key.parse::<Role>() {
                Ok(role) => {
                    if seen_roles.contains(&role) {
                        errors.push(format!("  ✗ role {} configured twice", role));
                    }
                    seen_roles.push(role);
                }
                Err(_) => errors.push(format!("  ✗ unknown role '{}'", key)),
            }
            if ids.is_empty() {
                errors.push(format!("  ✗ role '{}' has no instances", key));
            }
            for id in ids {
                if !self.instances.contains_key(id) {
                    warn!(role = %key, instance = %id, "role references instance without connection URL");
                }
            }
        }

        for (id, url) in &self.instances {
            if url.trim().is_empty() {
                errors.push(format!("  ✗ instance '{}' has an empty URL", id));
            }
        }

        if self.database.min_pool_size > self.database.max_pool_size {
            errors.push(format!(
                "  ✗ min_pool_size {} exceeds max_pool_size {}",
                self.database.min_pool_size, self.database.max_pool_size
            ));
        }

        if self.replication.enabled {
            for (name, value) in [
                ("owner", &self.replication.owner),
                ("repository", &self.replication.repository),
                ("token", &self.replication.token),
            ] {
                if value.is_empty() {
                    errors.push(format!("  ✗ replication.{} is required when enabled", name));
                }
            }
        }

        if !errors.is_empty() {
            return Err(MeshError::config(format!(
                "validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MeshError::config(format!("failed to serialize config: {}", e)))
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MeshError::config(format!("{} must be a number, got '{}'", key, value)))
}

/// Replace every `${NAME}` with the looked-up value (empty when unset)
fn expand_string(s: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                result.push_str(&lookup(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
diagnostics = true

[database]
name = "school"
max_pool_size = 4
min_pool_size = 1

[instances]
ins1 = "memory://one"
ins2 = "memory://two"

[roles]
director = ["ins1", "ins2"]
R = ["ins2"]
"#;

    #[test]
    fn test_parse_sample() {
        let config = MeshConfig::from_toml_str(SAMPLE).unwrap();
        assert!(config.diagnostics);
        assert_eq!(config.database.name, "school");
        assert_eq!(config.database.connect_timeout_ms, 10_000);
        assert_eq!(config.instances.len(), 2);

        let roles = config.role_assignments().unwrap();
        assert!(roles.contains(&(Role::Guardian, vec!["ins2".to_string()])));
        assert!(!config.replication.enabled);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE).unwrap();
        let config = MeshConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.roles.len(), 2);

        let missing = MeshConfig::load(Some(Path::new("/nonexistent/replimesh.toml")));
        assert!(matches!(missing, Err(MeshError::Config { .. })));
    }

    #[test]
    fn test_expand_string() {
        let lookup = |name: &str| match name {
            "HOST" => Some("db.local".to_string()),
            _ => None,
        };
        assert_eq!(
            expand_string("mongodb://${HOST}:27017/${MISSING}x", &lookup),
            "mongodb://db.local:27017/x"
        );
        assert_eq!(expand_string("no vars", &lookup), "no vars");
        assert_eq!(expand_string("broken ${HOST", &lookup), "broken ${HOST");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = MeshConfig::from_toml_str(SAMPLE).unwrap();
        config.roles.insert("tutor".to_string(), Vec::new());
        config.database.min_pool_size = 50;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("has no instances"));
        assert!(err.contains("min_pool_size"));

        let mut config = MeshConfig::from_toml_str(SAMPLE).unwrap();
        config.replication.enabled = true;
        assert!(config.validate().is_err());

        let bad_role = "[roles]\njanitor = [\"ins1\"]\n";
        assert!(MeshConfig::from_toml_str(bad_role).is_err());
    }

    #[test]
    fn test_from_vars() {
        let vars = vec![
            ("REPLIMESH_INSTANCE_INS1_URL".to_string(), "memory://one".to_string()),
            ("REPLIMESH_INSTANCE_INS2_URL".to_string(), "memory://two".to_string()),
            ("REPLIMESH_ROLE_PP_INSTANCES".to_string(), "INS1, ins2".to_string()),
            ("MONGO_MAX_POOL_SIZE".to_string(), "20".to_string()),
            ("REPLIMESH_ENV".to_string(), "D".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let config = MeshConfig::from_vars(vars).unwrap();
        assert_eq!(config.instances["ins1"], "memory://one");
        assert_eq!(
            config.roles["primary_teacher"],
            vec!["ins1".to_string(), "ins2".to_string()]
        );
        assert_eq!(config.database.max_pool_size, 20);
        assert!(config.diagnostics);
        assert!(!config.replication.enabled);
        config.validate().unwrap();

        let bad = vec![("MONGO_MAX_POOL_SIZE".to_string(), "lots".to_string())];
        assert!(MeshConfig::from_vars(bad).is_err());
    }

    #[test]
    fn test_dispatch_url() {
        let replication = ReplicationConfig {
            owner: "school".to_string(),
            repository: "replicator".to_string(),
            api_base: "https://api.github.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            replication.dispatch_url(),
            "https://api.github.com/repos/school/replicator/dispatches"
        );
    }
}
