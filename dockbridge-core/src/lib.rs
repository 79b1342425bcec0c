pub mod config;
pub mod error;
pub mod models;

pub use config::{DeployConfig, DEFAULT_CONFIG_FILE};
pub use error::{DockBridgeError, Result};
pub use models::*;
