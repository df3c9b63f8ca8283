use serde::{Deserialize, Serialize};

use crate::error::{Result, WebApiError};

fn default_api_version() -> String {
    "v9.2".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Connection settings for an OData v4 entity Web API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebApiConfig {
    /// Organisation root, e.g. `https://contoso.crm.dynamics.com`.
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Sent as `Prefer: odata.maxpagesize=<n>` when set.
    #[serde(default)]
    pub max_page_size: Option<u32>,
}

impl WebApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_version: default_api_version(),
            access_token: None,
            timeout_secs: default_timeout_secs(),
            max_page_size: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Read `SUBGRID_BASE_URL` (required), `SUBGRID_ACCESS_TOKEN` and `SUBGRID_API_VERSION`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("SUBGRID_BASE_URL")
            .map_err(|_| WebApiError::MissingSetting("SUBGRID_BASE_URL"))?;
        let mut config = Self::new(base_url);
        if let Ok(token) = std::env::var("SUBGRID_ACCESS_TOKEN") {
            config.access_token = Some(token);
        }
        if let Ok(version) = std::env::var("SUBGRID_API_VERSION") {
            config.api_version = version;
        }
        Ok(config)
    }

    /// `<base>/api/data/<version>` without a trailing slash.
    pub fn api_root(&self) -> Result<String> {
        let base = self.base_url.trim().trim_end_matches('/');
        if !(base.starts_with("https://") || base.starts_with("http://")) {
            return Err(WebApiError::InvalidBaseUrl(self.base_url.clone()));
        }
        Ok(format!("{}/api/data/{}", base, self.api_version))
    }
}
