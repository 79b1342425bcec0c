use crate::error::{DockBridgeError, Result};
use crate::models::ComposeService;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "dockbridge.toml";

/// Deployment settings, usually read from `dockbridge.toml`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    pub project_name: String,
    pub dockerfile_path: String,
    pub compose_file_path: String,
    pub build_context: String,
    /// Program used for `docker ...` commands.
    pub docker_path: String,
    /// Standalone compose program; the `docker compose` plugin is tried when it is missing.
    pub compose_path: String,
    pub registry_url: Option<String>,
    pub pull_on_deploy: bool,
    pub prune_after_deploy: bool,
    /// Default deadline for build and compose-up, in seconds. 0 disables it.
    pub timeout_seconds: i64,
    pub build_args: BTreeMap<String, String>,
    pub target_platform: Option<String>,
    pub services: Vec<ComposeService>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            project_name: "my-project".to_string(),
            dockerfile_path: "Dockerfile".to_string(),
            compose_file_path: "docker-compose.yml".to_string(),
            build_context: ".".to_string(),
            docker_path: "docker".to_string(),
            compose_path: "docker-compose".to_string(),
            registry_url: None,
            pull_on_deploy: false,
            prune_after_deploy: false,
            timeout_seconds: 300,
            build_args: BTreeMap::new(),
            target_platform: None,
            services: Vec::new(),
        }
    }
}

impl DeployConfig {
    /// Parse and validate a config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DeployConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("project_name", &self.project_name),
            ("dockerfile_path", &self.dockerfile_path),
            ("compose_file_path", &self.compose_file_path),
            ("build_context", &self.build_context),
            ("docker_path", &self.docker_path),
            ("compose_path", &self.compose_path),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(DockBridgeError::InvalidConfiguration(format!(
                    "{} must not be empty",
                    field
                )));
            }
        }

        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(DockBridgeError::InvalidConfiguration(
                    "compose service without a name".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Tag used when building the project image
    pub fn image_tag(&self) -> String {
        format!("{}:latest", self.project_name)
    }
}
