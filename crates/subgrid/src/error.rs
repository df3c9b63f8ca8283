use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid entity name: '{0}'")]
    InvalidEntityName(String),

    #[error("Schema unavailable for entity '{entity}'")]
    SchemaUnavailable { entity: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
