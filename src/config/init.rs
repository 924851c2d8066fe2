// ABOUTME: Config scaffolding for new projects.
// ABOUTME: Creates rollout.yml template files.

use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{ImageRef, ServiceName};

use super::CONFIG_FILENAME;

const DEFAULT_SERVICE: &str = "my-app";
const DEFAULT_IMAGE: &str = "registry.example.com/my-app:latest";

pub fn init_config(
    dir: &Path,
    service: Option<&str>,
    image: Option<&str>,
    force: bool,
) -> Result<()> {
    let config_path = dir.join(CONFIG_FILENAME);

    if config_path.exists() && !force {
        return Err(Error::AlreadyExists(config_path));
    }

    let service = ServiceName::new(service.unwrap_or(DEFAULT_SERVICE))
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    let image = ImageRef::parse(image.unwrap_or(DEFAULT_IMAGE))
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;

    std::fs::write(&config_path, template_yaml(&service, &image))?;
    tracing::debug!("Wrote {}", config_path.display());

    Ok(())
}

fn template_yaml(service: &ServiceName, image: &ImageRef) -> String {
    format!(
        r#"service: {service}
image: {image}
replicas: 1
ports:
  - 8080
# probe:
#   http: {{ path: /health, port: 8080 }}
#   period: 10s

# Build from source before deploying. Without `source` the image is deployed as-is.
# source:
#   repository_url: https://github.com/example/{service}.git
#   branch: main
# build:
#   strategy: {{ type: nixpacks }}

# Where clone and build scripts run: `local` or `[user@]host[:port]`
target: local

orchestrator:
  type: swarm
# orchestrator:
#   type: cluster
#   namespace: default

pipeline:
  on_conflict: reject
  auto_rollback: true
  health_timeout: 2m
"#
    )
}
