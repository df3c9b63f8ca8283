use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Where the engine runs; local development suppresses saved-view clauses
/// because views cannot resolve against a local harness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Hosted,
    Local,
}

impl std::str::FromStr for RuntimeEnvironment {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hosted" => Ok(RuntimeEnvironment::Hosted),
            "local" => Ok(RuntimeEnvironment::Local),
            other => Err(EngineError::Config(format!(
                "unknown environment '{other}' (expected 'hosted' or 'local')"
            ))),
        }
    }
}

/// Engine configuration, loadable from YAML.
///
/// Every field has a default so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub environment: RuntimeEnvironment,
    pub max_concurrency: usize,
    pub request_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    /// `None` keeps schemas until an explicit cache clear.
    pub schema_ttl_secs: Option<u64>,
    pub sample_size: usize,
    pub parent_sample_size: usize,
    pub history_limit: usize,
    pub self_healing: bool,
    pub probe_collection: String,
    pub probe_query: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: RuntimeEnvironment::Hosted,
            max_concurrency: 3,
            request_timeout_ms: 30_000,
            probe_timeout_ms: 5_000,
            schema_ttl_secs: None,
            sample_size: 5,
            parent_sample_size: 50,
            history_limit: 100,
            self_healing: true,
            probe_collection: "systemusers".to_string(),
            probe_query: "?$select=systemuserid&$top=1".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validated()
    }

    /// Apply `SUBGRID_*` environment overrides on top of this configuration.
    ///
    /// Unparseable values are ignored with a warning. The result is validated
    /// again, so an override cannot produce a configuration a file could not.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Same as `with_env_overrides`, reading variables through `lookup`.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("SUBGRID_ENVIRONMENT") {
            match raw.parse() {
                Ok(env) => self.environment = env,
                Err(e) => tracing::warn!("[EngineConfig] Ignoring SUBGRID_ENVIRONMENT: {}", e),
            }
        }
        if let Some(value) = number_override(&lookup, "SUBGRID_MAX_CONCURRENCY") {
            self.max_concurrency = value as usize;
        }
        if let Some(value) = number_override(&lookup, "SUBGRID_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = value;
        }
        if let Some(value) = number_override(&lookup, "SUBGRID_SCHEMA_TTL_SECS") {
            self.schema_ttl_secs = Some(value);
        }
        self.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.history_limit == 0 {
            return Err(EngineError::Config(
                "history_limit must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn schema_ttl(&self) -> Option<Duration> {
        self.schema_ttl_secs.map(Duration::from_secs)
    }
}

fn number_override<F>(lookup: &F, name: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("[EngineConfig] Ignoring {}='{}': {}", name, raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_yaml_uses_defaults() {
        let config = EngineConfig::from_yaml("environment: local\nmax_concurrency: 5\n").unwrap();
        assert_eq!(config.environment, RuntimeEnvironment::Local);
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.history_limit, 100);
        assert_eq!(config.schema_ttl(), None);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = EngineConfig::from_yaml("max_concurrency: 0").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let err = EngineConfig::from_yaml("max_concurrency: [").unwrap_err();
        assert!(matches!(err, EngineError::Yaml(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "schema_ttl_secs: 600\nself_healing: false").unwrap();

        let config = EngineConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.schema_ttl(), Some(Duration::from_secs(600)));
        assert!(!config.self_healing);
    }

    fn vars(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn overrides_replace_file_values() {
        let config = EngineConfig::default()
            .with_overrides_from(vars(&[
                ("SUBGRID_ENVIRONMENT", "local"),
                ("SUBGRID_MAX_CONCURRENCY", "8"),
                ("SUBGRID_SCHEMA_TTL_SECS", "soon"),
            ]))
            .unwrap();
        assert_eq!(config.environment, RuntimeEnvironment::Local);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.schema_ttl_secs, None);
    }

    #[test]
    fn zero_concurrency_override_is_rejected() {
        let err = EngineConfig::default()
            .with_overrides_from(vars(&[("SUBGRID_MAX_CONCURRENCY", "0")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn environment_parsing() {
        assert_eq!(
            "LOCAL".parse::<RuntimeEnvironment>().unwrap(),
            RuntimeEnvironment::Local
        );
        assert!("staging".parse::<RuntimeEnvironment>().is_err());
    }
}
