use dockbridge_core::{ComposeService, DockBridgeError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

pub const COMPOSE_VERSION: &str = "3.8";

/// A docker-compose document built from service definitions
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeFile {
    pub version: String,
    pub services: Vec<ComposeService>,
}

#[derive(Serialize)]
struct Document {
    version: String,
    services: BTreeMap<String, ServiceEntry>,
    networks: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    volumes: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct ServiceEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    build: Option<BuildEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    networks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart: Option<String>,
}

#[derive(Serialize)]
struct BuildEntry {
    context: String,
}

impl ComposeFile {
    pub fn new(services: Vec<ComposeService>) -> Self {
        Self {
            version: COMPOSE_VERSION.to_string(),
            services,
        }
    }

    /// A web service built from the current directory, backed by postgres.
    pub fn default_stack() -> Self {
        Self::new(vec![
            ComposeService::new("web")
                .with_build_context(".")
                .with_port("5000:5000")
                .with_env("NODE_ENV", "production")
                .with_dependency("db"),
            ComposeService::new("db")
                .with_image("postgres:13")
                .with_env("POSTGRES_DB", "appdb")
                .with_env("POSTGRES_USER", "user")
                .with_env("POSTGRES_PASSWORD", "password")
                .with_volume("postgres_data:/var/lib/postgresql/data"),
        ])
    }

    /// Volumes referenced by name rather than by host path
    pub fn named_volumes(&self) -> BTreeSet<String> {
        self.services
            .iter()
            .flat_map(|s| s.volumes.iter())
            .filter_map(|v| {
                let (source, _) = v.split_once(':')?;
                let is_path = source.is_empty()
                    || source.starts_with('.')
                    || source.starts_with('/')
                    || source.starts_with('~')
                    || source.contains('\\');
                (!is_path).then(|| source.to_string())
            })
            .collect()
    }

    pub fn to_yaml(&self) -> Result<String> {
        let mut services = BTreeMap::new();
        for service in &self.services {
            if services.contains_key(&service.name) {
                return Err(DockBridgeError::TemplateError(format!(
                    "duplicate service name: {}",
                    service.name
                )));
            }
            services.insert(service.name.clone(), ServiceEntry::from(service));
        }

        let mut networks = BTreeMap::new();
        networks.insert(
            "default".to_string(),
            BTreeMap::from([("driver".to_string(), "bridge".to_string())]),
        );

        let document = Document {
            version: self.version.clone(),
            services,
            networks,
            volumes: self
                .named_volumes()
                .into_iter()
                .map(|name| (name, BTreeMap::new()))
                .collect(),
        };

        serde_yaml::to_string(&document).map_err(|e| DockBridgeError::TemplateError(e.to_string()))
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

impl From<&ComposeService> for ServiceEntry {
    fn from(service: &ComposeService) -> Self {
        Self {
            image: service.image.clone(),
            build: service
                .build_context
                .as_ref()
                .map(|context| BuildEntry {
                    context: context.clone(),
                }),
            ports: service.ports.clone(),
            environment: service.environment.clone(),
            depends_on: service.depends_on.clone(),
            volumes: service.volumes.clone(),
            networks: service.networks.clone(),
            restart: service.restart.clone(),
        }
    }
}

/// Render a minimal Dockerfile: one `FROM` line followed by the instructions verbatim.
pub fn dockerfile(base_image: &str, instructions: &[&str]) -> String {
    let mut content = format!("FROM {}\n", base_image);
    for line in instructions {
        content.push_str(line.trim_end());
        content.push('\n');
    }
    content
}

/// Dockerfile for the `web` service of [`ComposeFile::default_stack`].
pub fn starter_dockerfile() -> String {
    dockerfile(
        "node:20-alpine",
        &[
            "WORKDIR /app",
            "COPY package*.json ./",
            "RUN npm install --omit=dev",
            "COPY . .",
            "EXPOSE 5000",
            "CMD [\"npm\", \"start\"]",
        ],
    )
}

/// Writes [`starter_dockerfile`] to `path` unless a file is already there.
/// Returns whether anything was written.
pub fn write_starter_dockerfile<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    if path.exists() {
        return Ok(false);
    }
    fs::write(path, starter_dockerfile())?;
    Ok(true)
}
