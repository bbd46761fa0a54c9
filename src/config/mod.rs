use std::env;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const CONFIG_PATH_ENV: &str = "QNODE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "qnode.toml";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub worker: WorkerSection,
    pub wire: WireConfig,
    pub queues: QueuesConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

/// Identity this node advertises to the cluster; also the listen address.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: u64,
    pub host: String,
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            host: "127.0.0.1".to_owned(),
            port: 7400,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Node id of the current leader; 0 means unknown.
    pub leader_id: u64,
    pub members: Vec<MemberConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MemberConfig {
    pub node_id: u64,
    pub host: String,
    pub port: u16,
}

impl ClusterConfig {
    pub fn member(&self, node_id: u64) -> Option<&MemberConfig> {
        self.members.iter().find(|member| member.node_id == node_id)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerSection {
    pub client_pool_capacity: u32,
    pub event_queue_capacity: u32,
    pub poll_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub forward_response_ttl_secs: u64,
    pub status_interval_secs: u64,
    /// Unsent bytes a connection may hold before it is dropped.
    pub max_pending_output_bytes: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            client_pool_capacity: 1024,
            event_queue_capacity: 4096,
            poll_timeout_ms: 2_000,
            heartbeat_interval_secs: 10,
            forward_response_ttl_secs: 30,
            status_interval_secs: 60,
            max_pending_output_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WireConfig {
    pub max_envelope_size_bytes: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: 1024 * 1024,
        }
    }
}

/// Queues created at startup, before any client touches them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueuesConfig {
    pub declared: Vec<String>,
}

impl AppConfig {
    /// Resolves the config file from `--config <path>`, then `QNODE_CONFIG`,
    /// then `./qnode.toml`. Without any file the built-in defaults are used.
    /// Remaining arguments are `--section.key value` overrides.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let (explicit_path, overrides) = split_config_path_arg(args)?;
        let path = explicit_path
            .or_else(|| env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .or_else(|| {
                let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
                candidate.is_file().then_some(candidate)
            });

        match path {
            Some(path) => Self::load_from_toml_with_args(path, overrides),
            None => Self::defaults_with_args(overrides),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let file_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.as_ref().to_string_lossy().to_string(),
                    source,
                })?;

        // Overlay the file on the defaults so overrides can target keys the
        // file leaves out.
        let mut root_value = default_value()?;
        merge_tables(&mut root_value, file_value);
        Self::finish(root_value, args)
    }

    pub fn defaults_with_args(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::finish(default_value()?, args)
    }

    fn finish(mut root_value: Value, args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 7] = [
            ("worker.client_pool_capacity", self.worker.client_pool_capacity > 0),
            ("worker.event_queue_capacity", self.worker.event_queue_capacity > 0),
            ("worker.poll_timeout_ms", self.worker.poll_timeout_ms > 0),
            ("worker.heartbeat_interval_secs", self.worker.heartbeat_interval_secs > 0),
            ("worker.forward_response_ttl_secs", self.worker.forward_response_ttl_secs > 0),
            ("worker.max_pending_output_bytes", self.worker.max_pending_output_bytes > 0),
            ("wire.max_envelope_size_bytes", self.wire.max_envelope_size_bytes > 0),
        ];

        for (key, valid) in checks {
            if !valid {
                return Err(ConfigError::InvalidSetting {
                    key,
                    reason: "must be greater than zero",
                });
            }
        }

        if self.node.host.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "node.host",
                reason: "must not be empty",
            });
        }
        // Addresses are dialed from the reactor thread, so no name lookups.
        if self.node.host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidSetting {
                key: "node.host",
                reason: "must be an IP address literal",
            });
        }
        if self
            .cluster
            .members
            .iter()
            .any(|member| member.host.parse::<IpAddr>().is_err())
        {
            return Err(ConfigError::InvalidSetting {
                key: "cluster.members.host",
                reason: "must be an IP address literal",
            });
        }

        Ok(())
    }

}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    SerializeDefaults(toml::ser::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidSetting {
        key: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::SerializeDefaults(source) => {
                write!(f, "failed to render default config: {source}")
            }
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidSetting { key, reason } => write!(f, "invalid setting '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::SerializeDefaults)
}

fn merge_tables(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        merge_tables(existing, value);
                    }
                    _ => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn split_config_path_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut path = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            path = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }

    Ok((path, rest))
}

fn parse_cli_overrides(args: impl IntoIterator<Item = String>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    let parsed_value = parse_value_using_current_type(key_path, raw_value, current)?;
    *current = parsed_value;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "qnode-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    const SAMPLE: &str = r#"
[logging]
level = "debug"
human_friendly = false

[node]
node_id = 2
host = "10.0.0.2"
port = 7402

[cluster]
leader_id = 1

[[cluster.members]]
node_id = 1
host = "10.0.0.1"
port = 7401

[[cluster.members]]
node_id = 2
host = "10.0.0.2"
port = 7402

[worker]
client_pool_capacity = 16

[queues]
declared = ["orders", "audit"]
"#;

    #[test]
    fn loads_partial_file_on_top_of_defaults() {
        let path = write_temp_config(SAMPLE, "partial");

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.node.node_id, 2);
        assert_eq!(config.worker.client_pool_capacity, 16);
        assert_eq!(config.worker.heartbeat_interval_secs, 10);
        assert_eq!(config.worker.forward_response_ttl_secs, 30);
        assert_eq!(config.cluster.members.len(), 2);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(SAMPLE, "override");

        let config = AppConfig::load_from_toml_with_args(
            &path,
            vec![
                "--logging.level".to_owned(),
                "trace".to_owned(),
                "--worker.poll_timeout_ms".to_owned(),
                "250".to_owned(),
                "--cluster.leader_id".to_owned(),
                "2".to_owned(),
            ],
        )
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.worker.poll_timeout_ms, 250);
        assert_eq!(config.cluster.leader_id, 2);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let err = AppConfig::defaults_with_args(vec!["--worker.nonexistent".to_owned(), "x".to_owned()])
            .expect_err("unknown override key should fail");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_array_overrides() {
        let err = AppConfig::defaults_with_args(vec!["--cluster.members".to_owned(), "x".to_owned()])
            .expect_err("array override should fail");

        assert!(matches!(err, ConfigError::UnsupportedOverrideType { .. }));
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = AppConfig::defaults_with_args(vec![
            "--worker.event_queue_capacity".to_owned(),
            "0".to_owned(),
        ])
        .expect_err("zero capacity should fail validation");

        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                key: "worker.event_queue_capacity",
                ..
            }
        ));
    }

    #[test]
    fn explicit_config_path_is_split_from_overrides() {
        let path = write_temp_config(SAMPLE, "discovery");

        let config = AppConfig::load_with_discovery(vec![
            "--config".to_owned(),
            path.to_string_lossy().to_string(),
            "--node.port".to_owned(),
            "9000".to_owned(),
        ])
        .expect("config should load through discovery");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.node.port, 9000);
        assert_eq!(config.node.host, "10.0.0.2");
    }

    #[test]
    fn declared_queues_and_output_cap_load() {
        let path = write_temp_config(SAMPLE, "queues");
        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.queues.declared, vec!["orders", "audit"]);
        assert_eq!(config.worker.max_pending_output_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn rejects_host_names_that_need_resolution() {
        let err = AppConfig::defaults_with_args(vec!["--node.host".to_owned(), "localhost".to_owned()])
            .expect_err("host names should be refused");
        assert!(matches!(
            err,
            ConfigError::InvalidSetting { key: "node.host", .. }
        ));

        let member_file = SAMPLE.replacen("host = \"10.0.0.1\"", "host = \"leader.internal\"", 1);
        let path = write_temp_config(&member_file, "member-host");
        let err = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect_err("member host names should be refused");
        fs::remove_file(path).expect("temp config cleanup should succeed");
        assert!(matches!(
            err,
            ConfigError::InvalidSetting { key: "cluster.members.host", .. }
        ));
    }

    #[test]
    fn member_lookup_by_node_id() {
        let path = write_temp_config(SAMPLE, "members");
        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        let first = &config.cluster.members[0];
        assert_eq!(config.cluster.member(first.node_id), Some(first));
        assert!(config.cluster.member(999).is_none());
    }
}
