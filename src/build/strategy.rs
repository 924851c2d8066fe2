// ABOUTME: Build strategies and the image build invocation for each one.
// ABOUTME: Every strategy produces a local image tagged with the descriptor's image reference.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::script::quote;
use crate::descriptor::DeploymentDescriptor;

const HEROKU_BUILDER_VERSION: &str = "24";
const PAKETO_BUILDER: &str = "paketobuildpacks/builder-jammy-full";
const RAILPACK_VERSION: &str = "0.2.2";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildStrategy {
    Nixpacks,
    HerokuBuildpacks {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    PaketoBuildpacks,
    Railpack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    /// Serve a directory of files from nginx.
    Static {
        #[serde(default = "default_publish_dir")]
        publish_dir: String,
    },
    Dockerfile {
        #[serde(default = "default_dockerfile")]
        dockerfile: String,
        /// Build context relative to the build path.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
}

fn default_publish_dir() -> String {
    ".".to_string()
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

impl BuildStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            BuildStrategy::Nixpacks => "nixpacks",
            BuildStrategy::HerokuBuildpacks { .. } => "heroku_buildpacks",
            BuildStrategy::PaketoBuildpacks => "paketo_buildpacks",
            BuildStrategy::Railpack { .. } => "railpack",
            BuildStrategy::Static { .. } => "static",
            BuildStrategy::Dockerfile { .. } => "dockerfile",
        }
    }
}

/// How to turn a checked-out repository into an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub strategy: BuildStrategy,
    /// Directory inside the repository to build from.
    #[serde(default = "default_build_path")]
    pub build_path: String,
    /// Docker build arguments, used by the dockerfile strategy.
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

fn default_build_path() -> String {
    ".".to_string()
}

impl BuildPlan {
    pub fn new(strategy: BuildStrategy) -> Self {
        Self {
            strategy,
            build_path: default_build_path(),
            build_args: BTreeMap::new(),
        }
    }
}

/// Path of `relative` inside `base`, without doubling separators or `.` segments.
fn join(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches("./").trim_matches('/');
    if relative.is_empty() || relative == "." {
        base.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), relative)
    }
}

fn env_flags(flag: &str, env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(k, v)| format!(" {} {}", flag, quote(&format!("{}={}", k, v))))
        .collect()
}

/// Strategy-specific build invocation for code checked out at `code_dir`.
///
/// The resulting image is tagged with `descriptor.image`.
pub fn build_command(plan: &BuildPlan, descriptor: &DeploymentDescriptor, code_dir: &str) -> String {
    let path = join(code_dir, &plan.build_path);
    let tag = quote(&descriptor.image.to_string());
    let qpath = quote(&path);

    match &plan.strategy {
        BuildStrategy::Nixpacks => format!(
            "nixpacks build {} --name {}{}",
            qpath,
            tag,
            env_flags("--env", &descriptor.env)
        ),
        BuildStrategy::HerokuBuildpacks { version } => format!(
            "pack build {} --path {} --builder heroku/builder:{}{}",
            tag,
            qpath,
            quote(version.as_deref().unwrap_or(HEROKU_BUILDER_VERSION)),
            env_flags("--env", &descriptor.env)
        ),
        BuildStrategy::PaketoBuildpacks => format!(
            "pack build {} --path {} --builder {}{}",
            tag,
            qpath,
            PAKETO_BUILDER,
            env_flags("--env", &descriptor.env)
        ),
        BuildStrategy::Railpack { version } => {
            let plan_file = quote(&join(&path, "railpack-plan.json"));
            let info_file = quote(&join(&path, "railpack-info.json"));
            format!(
                "railpack prepare {path} --plan-out {plan} --info-out {info}{env}; \
                 docker buildx build --build-arg BUILDKIT_SYNTAX=ghcr.io/railwayapp/railpack-frontend:v{ver} \
                 -f {plan} --output type=docker,name={tag} {path}",
                path = qpath,
                plan = plan_file,
                info = info_file,
                env = env_flags("--env", &descriptor.env),
                ver = quote(version.as_deref().unwrap_or(RAILPACK_VERSION)),
                tag = tag,
            )
        }
        BuildStrategy::Static { publish_dir } => {
            let dockerfile = join(&path, "Dockerfile.rollout");
            let lines = [
                "FROM nginx:alpine".to_string(),
                "WORKDIR /usr/share/nginx/html/".to_string(),
                format!("COPY {} .", join(".", publish_dir)),
                "CMD [\"nginx\", \"-g\", \"daemon off;\"]".to_string(),
            ];
            let quoted: Vec<String> = lines.iter().map(|l| quote(l)).collect();
            format!(
                "printf '%s\\n' {} > {}; docker build -t {} -f {} {}",
                quoted.join(" "),
                quote(&dockerfile),
                tag,
                quote(&dockerfile),
                qpath
            )
        }
        BuildStrategy::Dockerfile {
            dockerfile,
            context,
            target,
        } => {
            let context = join(&path, context.as_deref().unwrap_or("."));
            let mut command = format!(
                "docker build -t {} -f {}",
                tag,
                quote(&join(&path, dockerfile))
            );
            if let Some(target) = target {
                command.push_str(&format!(" --target {}", quote(target)));
            }
            command.push_str(&env_flags("--build-arg", &plan.build_args));
            command.push(' ');
            command.push_str(&quote(&context));
            command
        }
    }
}
