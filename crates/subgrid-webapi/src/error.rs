use thiserror::Error;

/// Errors raised while building a client; request failures are `ServiceFailure`s.
#[derive(Debug, Error)]
pub enum WebApiError {
    #[error("Invalid base URL '{0}': expected an http(s) URL")]
    InvalidBaseUrl(String),

    #[error("Invalid header value for {0}")]
    InvalidHeader(String),

    #[error("Missing setting: {0}")]
    MissingSetting(&'static str),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, WebApiError>;
