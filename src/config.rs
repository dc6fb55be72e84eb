//! Configuration loading and types for gemdrive.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every section has defaults, so an empty file (or no
//! file at all) yields a runnable server with no mounts.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::auth::Privilege;
use crate::storage::router::validate_mount_name;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Mounted backends and the image cache.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Token store location.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Hostname -> root prefix.  Requests arriving for a mapped host are
    /// served from that prefix.
    #[serde(default)]
    pub domain_map: BTreeMap<String, String>,

    /// Authorization settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            data_dir: default_data_dir(),
            domain_map: BTreeMap::new(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds in-flight requests get to finish after a shutdown signal.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root for cached image renditions; each mount gets a subdirectory.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Backends to mount, in order.
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            mounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Local,
    Memory,
}

/// One mounted backend.
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    /// Directory to serve (local mounts).
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Mount name; defaults to the last component of `path`.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_mount_kind")]
    pub kind: MountKind,

    /// Hide the write capability.
    #[serde(default)]
    pub read_only: bool,
}

impl MountConfig {
    /// Local mount of `path` under its directory name.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            name: None,
            kind: MountKind::Local,
            read_only: false,
        }
    }

    /// Effective mount name.
    pub fn mount_name(&self) -> Option<String> {
        if let Some(name) = &self.name {
            return Some(name.clone());
        }
        self.path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// Authorization settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Scopes granted to every caller.
    #[serde(default)]
    pub anonymous: Vec<Privilege>,

    /// Lifetime of minted tokens.
    #[serde(default = "default_token_ttl_days")]
    pub token_ttl_days: u64,

    /// Lifetime of a pending authorization.
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            anonymous: Vec::new(),
            token_ttl_days: default_token_ttl_days(),
            pending_ttl_secs: default_pending_ttl_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

impl Config {
    /// Reject mount tables that cannot be served.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for mount in &self.storage.mounts {
            if mount.kind == MountKind::Local && mount.path.is_none() {
                anyhow::bail!("Local mount requires a path");
            }
            let name = mount
                .mount_name()
                .ok_or_else(|| anyhow::anyhow!("Mount needs a name or a path"))?;
            validate_mount_name(&name)?;
            if !seen.insert(name.clone()) {
                anyhow::bail!("Duplicate mount name: {name}");
            }
        }
        for (host, root) in &self.domain_map {
            if !root.starts_with('/') {
                anyhow::bail!("Domain map root for {host} must start with '/': {root}");
            }
        }
        Ok(())
    }
}

// -- Default value functions -------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3838
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./gemdrive")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./gemdrive/cache")
}

fn default_mount_kind() -> MountKind {
    MountKind::Local
}

fn default_token_ttl_days() -> u64 {
    365
}

fn default_pending_ttl_secs() -> u64 {
    900
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Permission;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 3838);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.shutdown_timeout, 30);
        assert_eq!(config.data_dir, PathBuf::from("./gemdrive"));
        assert_eq!(config.auth.token_ttl_days, 365);
        assert!(config.observability.metrics);
        assert!(config.storage.mounts.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
server:
  port: 9000
storage:
  cache_dir: /var/cache/gemdrive
  mounts:
    - path: /srv/photos
    - path: /srv/docs
      name: papers
      read_only: true
    - kind: memory
      name: scratch
domain_map:
  photos.example.com: /photos
auth:
  anonymous:
    - path: /photos
      perm: read
logging:
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9000);
        let names: Vec<_> = config
            .storage
            .mounts
            .iter()
            .map(|m| m.mount_name().unwrap())
            .collect();
        assert_eq!(names, vec!["photos", "papers", "scratch"]);
        assert!(config.storage.mounts[1].read_only);
        assert_eq!(config.storage.mounts[2].kind, MountKind::Memory);
        assert_eq!(config.domain_map["photos.example.com"], "/photos");
        assert_eq!(config.auth.anonymous[0].perm, Permission::Read);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = Config::default();
        config.storage.mounts.push(MountConfig::local("/a/shared"));
        config.storage.mounts.push(MountConfig::local("/b/shared"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_validate_rejects_reserved_and_missing() {
        let mut config = Config::default();
        config.storage.mounts.push(MountConfig::local("/srv/gemdrive"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.mounts.push(MountConfig {
            path: None,
            name: Some("x".into()),
            kind: MountKind::Local,
            read_only: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gemdrive.yaml");
        std::fs::write(&path, "server:\n  port: 4000\n").unwrap();
        assert_eq!(load_config(&path).unwrap().server.port, 4000);
        assert!(load_config(dir.path().join("missing.yaml")).is_err());
    }
}
