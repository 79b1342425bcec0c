use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockBridgeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, DockBridgeError>;
