//! # Engine Configuration
//!
//! Runtime knobs for the engine, loadable from a TOML file. Every section and field has a
//! default, so an empty file (or no file) yields a working process-backed engine.
//!
//! ```toml
//! [pool]
//! max_sandboxes_per_function = 4
//! max_warm_per_function = 2
//! idle_ttl_ms = 60000
//!
//! [scheduler]
//! max_concurrent_invocations = 64
//!
//! [driver]
//! kind = "docker"
//! ```
//!
//! Functions themselves are described in a separate manifest ([`FunctionManifest`]) with one
//! `[[function]]` table per [`FunctionSpec`].

use crate::types::FunctionSpec;
use crate::utils::time;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Errors raised while loading configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub driver: DriverConfig,
}

impl EngineConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_sandboxes_per_function == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_sandboxes_per_function must be at least 1".into(),
            ));
        }
        if self.pool.max_warm_per_function > self.pool.max_sandboxes_per_function {
            return Err(ConfigError::Invalid(
                "pool.max_warm_per_function cannot exceed pool.max_sandboxes_per_function".into(),
            ));
        }
        if self.scheduler.max_concurrent_invocations == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_invocations must be at least 1".into(),
            ));
        }
        if self.scheduler.max_concurrent_per_function == Some(0) {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_per_function must be at least 1".into(),
            ));
        }
        if self.driver.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "driver.max_output_bytes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Sandbox pool sizing and eviction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Ceiling on warm + busy + creating sandboxes per function.
    pub max_sandboxes_per_function: usize,
    /// Idle sandboxes kept per function; the least recently used beyond this are destroyed.
    pub max_warm_per_function: usize,
    /// Acquirers allowed to queue per function; beyond this acquisition fails with
    /// `pool_exhausted`. Zero rejects instead of queueing.
    pub max_waiters_per_function: usize,
    /// Idle sandboxes older than this are destroyed by the sweep.
    #[serde(with = "time::millis", rename = "idle_ttl_ms")]
    pub idle_ttl: Duration,
    /// Idle sandboxes older than this are frozen, when the driver supports it.
    #[serde(
        default,
        with = "option_millis",
        rename = "freeze_after_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub freeze_after: Option<Duration>,
    #[serde(with = "time::millis", rename = "sweep_interval_ms")]
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sandboxes_per_function: 4,
            max_warm_per_function: 2,
            max_waiters_per_function: 256,
            idle_ttl: Duration::from_secs(60),
            freeze_after: None,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Admission control for invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Global cap on simultaneously executing invocations.
    pub max_concurrent_invocations: usize,
    /// Per-function cap; `None` defers to the pool ceiling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_per_function: Option<usize>,
    /// Invocations allowed to queue for a concurrency slot, globally.
    pub max_queued_invocations: usize,
    /// How long to wait for a driver to confirm a kill before giving up on it.
    #[serde(with = "time::millis", rename = "kill_grace_ms")]
    pub kill_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_invocations: 64,
            max_concurrent_per_function: None,
            max_queued_invocations: 1024,
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Isolation backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Child process in a private scratch directory.
    #[default]
    Process,
    /// Docker container.
    Docker,
    /// Docker container under the gVisor `runsc` runtime.
    Gvisor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub kind: DriverKind,
    /// Cap on captured stdout/stderr per invocation.
    pub max_output_bytes: usize,
    /// Parent directory for process-driver scratch directories (system temp if unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_root: Option<PathBuf>,
    pub container: ContainerConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Process,
            max_output_bytes: 1024 * 1024,
            scratch_root: None,
            container: ContainerConfig::default(),
        }
    }
}

/// Settings shared by the container backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Container CLI to drive.
    pub binary: String,
    /// Network mode passed to `--network`; `None` keeps the runtime default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// OCI runtime for the gVisor backend.
    pub gvisor_runtime: String,
    /// Whether idle containers may be paused.
    pub allow_freeze: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            network: Some("none".to_string()),
            gvisor_runtime: "runsc".to_string(),
            allow_freeze: true,
        }
    }
}

mod option_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => {
                serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// A set of functions to deploy, as written in a manifest file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FunctionManifest {
    #[serde(default, rename = "function")]
    pub functions: Vec<FunctionSpec>,
}

impl FunctionManifest {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for spec in &self.functions {
            spec.validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !seen.insert(spec.id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "function '{}' is declared more than once",
                    spec.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.driver.kind, DriverKind::Process);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config: EngineConfig = toml::from_str(
            r#"
            [pool]
            max_sandboxes_per_function = 1
            max_warm_per_function = 1
            idle_ttl_ms = 250
            freeze_after_ms = 100

            [driver]
            kind = "gvisor"
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max_sandboxes_per_function, 1);
        assert_eq!(config.pool.idle_ttl, Duration::from_millis(250));
        assert_eq!(config.pool.freeze_after, Some(Duration::from_millis(100)));
        assert_eq!(config.pool.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.driver.kind, DriverKind::Gvisor);
        assert_eq!(config.driver.container.gvisor_runtime, "runsc");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let parsed: Result<EngineConfig, _> = toml::from_str("[pool]\nmax_slots = 3\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validation_rejects_inconsistent_pool() {
        let mut config = EngineConfig::default();
        config.pool.max_warm_per_function = config.pool.max_sandboxes_per_function + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_manifest_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [[function]]
            id = "hello"
            runtime = "python"
            artifact = {{ image = "my-python-base", command = ["python", "function.py"] }}
            limits = {{ timeout_ms = 5000, memory_mb = 256 }}
            env = {{ GREETING = "hi" }}

            [[function]]
            id = "echo"
            artifact = {{ image = ".", command = ["cat"] }}
            "#
        )
        .unwrap();

        let manifest = FunctionManifest::load_from_file(file.path()).unwrap();
        assert_eq!(manifest.functions.len(), 2);
        assert_eq!(manifest.functions[0].limits.memory_mb, 256);
        assert_eq!(manifest.functions[0].env["GREETING"], "hi");
        assert_eq!(manifest.functions[1].limits.cpu_shares, 1024);
    }

    #[test]
    fn test_manifest_rejects_duplicates() {
        let manifest: FunctionManifest = toml::from_str(
            r#"
            [[function]]
            id = "a"
            artifact = { image = ".", command = ["cat"] }
            [[function]]
            id = "a"
            artifact = { image = ".", command = ["cat"] }
            "#,
        )
        .unwrap();
        assert!(matches!(manifest.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_demo_files_parse() {
        let config: EngineConfig = toml::from_str(include_str!("../../demos/engine.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());

        let manifest: FunctionManifest =
            toml::from_str(include_str!("../../demos/functions.toml")).unwrap();
        manifest.validate().unwrap();
        assert_eq!(manifest.functions.len(), 2);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = EngineConfig::load_from_file("/no/such/fnexec.toml").unwrap_err();
        assert!(err.to_string().contains("/no/such/fnexec.toml"));
    }
}
