use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use subgrid::EngineConfig;
use subgrid_webapi::WebApiConfig;

/// Contents of the CLI's YAML configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Falls back to `SUBGRID_BASE_URL` and friends when absent.
    #[serde(default)]
    pub webapi: Option<WebApiConfig>,
}

impl CliConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;
        Self::from_yaml(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML {}: {}", path.display(), e))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: CliConfig = serde_yaml::from_str(content)?;
        // Re-run the engine's own validation on the nested section.
        let engine_yaml = serde_yaml::to_string(&config.engine)?;
        let engine = EngineConfig::from_yaml(&engine_yaml)?;
        Ok(Self { engine, ..config })
    }

    /// Environment overrides applied on top of the file.
    pub fn resolve(self) -> Result<(EngineConfig, WebApiConfig)> {
        let engine = self.engine.with_env_overrides()?;
        let webapi = match self.webapi {
            Some(webapi) => webapi,
            None => WebApiConfig::from_env()
                .context("No Web API settings: add a `webapi` section or set SUBGRID_BASE_URL")?,
        };
        Ok((engine, webapi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use subgrid::RuntimeEnvironment;

    #[test]
    fn loads_nested_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "engine:\n  environment: local\n  max_concurrency: 5\nwebapi:\n  base_url: https://org.example.test\n  access_token: abc"
        )
        .unwrap();

        let config = CliConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.engine.environment, RuntimeEnvironment::Local);
        assert_eq!(config.engine.max_concurrency, 5);
        let webapi = config.webapi.unwrap();
        assert_eq!(webapi.base_url, "https://org.example.test");
        assert_eq!(webapi.api_version, "v9.2");
    }

    #[test]
    fn engine_section_is_validated() {
        let err = CliConfig::from_yaml("engine:\n  max_concurrency: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = CliConfig::load_from_file(Path::new("/nonexistent/subgrid.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/subgrid.yaml"));
    }
}
