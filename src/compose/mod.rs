pub mod env;

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;

use crate::model::{Application, BuildPack, DeploymentRecord};
use crate::rollout::health;

const COMPOSE_TEMPLATE: &str = include_str!("../../templates/compose.yaml.j2");

pub const LABEL_MANAGED: &str = "berth.managed";
pub const LABEL_APPLICATION: &str = "berth.applicationId";
pub const LABEL_PULL_REQUEST: &str = "berth.pullRequestId";
pub const LABEL_DEPLOYMENT: &str = "berth.deploymentUuid";
/// Set by docker compose on every container of a project.
pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";

#[derive(Debug, Clone, Serialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub test: String,
    pub interval: u64,
    pub timeout: u64,
    pub retries: u32,
    pub start_period: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposeService {
    pub name: String,
    pub image: String,
    pub container_name: String,
    pub network: String,
    pub aliases: Vec<String>,
    pub labels: Vec<Label>,
    pub ports: Vec<String>,
    pub healthcheck: Option<HealthCheck>,
}

pub fn labels(app: &Application, record: &DeploymentRecord) -> Vec<Label> {
    [
        (LABEL_MANAGED, "true".to_string()),
        (LABEL_APPLICATION, app.id.to_string()),
        (LABEL_PULL_REQUEST, record.pull_request_id.to_string()),
        (LABEL_DEPLOYMENT, record.deployment_uuid.clone()),
    ]
    .into_iter()
    .map(|(key, value)| Label {
        key: key.to_string(),
        value,
    })
    .collect()
}

/// Label filter matching every container of the application's deployment line.
///
/// User compose files carry none of our labels, so their containers are
/// found through the project name they run under.
pub fn container_filter(app: &Application, pull_request_id: u64) -> String {
    if app.build_pack == BuildPack::Compose {
        return format!(
            "--filter label={}={}",
            LABEL_COMPOSE_PROJECT,
            app.container_base_name(pull_request_id)
        );
    }
    format!(
        "--filter label={}={} --filter label={}={}",
        LABEL_APPLICATION, app.id, LABEL_PULL_REQUEST, pull_request_id
    )
}

pub fn service_for(
    app: &Application,
    record: &DeploymentRecord,
    image: &str,
    container_name: &str,
) -> ComposeService {
    let base = app.container_base_name(record.pull_request_id);
    let mut aliases = Vec::new();
    if base != container_name {
        aliases.push(base.clone());
    }
    if let Some(custom) = &app.settings.custom_internal_name {
        if !aliases.contains(custom) && custom != container_name {
            aliases.push(custom.clone());
        }
    }

    let healthcheck = app.health_check.enabled.then(|| HealthCheck {
        test: health::probe_command(&app.health_check, app.health_port()),
        interval: app.health_check.interval,
        timeout: app.health_check.timeout,
        retries: app.health_check.retries,
        start_period: app.health_check.start_period,
    });

    ComposeService {
        name: base,
        image: image.to_string(),
        container_name: container_name.to_string(),
        network: app.network.clone(),
        aliases,
        labels: labels(app, record),
        ports: app.port_mappings.clone(),
        healthcheck,
    }
}

pub fn render(service: &ComposeService, deployment_uuid: &str) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("compose", COMPOSE_TEMPLATE)
        .context("Failed to load compose template")?;

    let tmpl = env.get_template("compose")?;
    let rendered = tmpl
        .render(minijinja::context! {
            service => service,
            deployment_uuid => deployment_uuid,
        })
        .context("Failed to render compose template")?;

    Ok(rendered)
}

/// Dockerfile serving a static build output with nginx.
pub fn static_dockerfile(publish_directory: &str) -> String {
    let dir = publish_directory.trim_matches('/');
    let source = if dir.is_empty() { "." } else { dir };
    format!(
        "FROM nginx:alpine\nCOPY ./{} /usr/share/nginx/html\nEXPOSE 80\n",
        source
    )
}
