use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Strategy used to turn the source into a runnable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPack {
    Dockerfile,
    Compose,
    Static,
    Image,
    Nixpacks,
}

impl BuildPack {
    pub fn uses_git(self) -> bool {
        !matches!(self, BuildPack::Image)
    }
}

impl fmt::Display for BuildPack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildPack::Dockerfile => "dockerfile",
            BuildPack::Compose => "compose",
            BuildPack::Static => "static",
            BuildPack::Image => "image",
            BuildPack::Nixpacks => "nixpacks",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Custom SSH port of the git host, if it is not 22
    pub port: Option<u16>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl GitSource {
    /// Repository URL with the custom port folded in.
    ///
    /// `git@host:org/repo.git` with port 2222 becomes
    /// `ssh://git@host:2222/org/repo.git`.
    pub fn clone_url(&self) -> String {
        let Some(port) = self.port else {
            return self.repository.clone();
        };
        if self.repository.contains("://") {
            return self.repository.clone();
        }
        match self.repository.split_once(':') {
            Some((host, path)) => format!("ssh://{}:{}/{}", host, port, path),
            None => self.repository.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Image repository, e.g. `registry.example.com/team/app`
    pub image: String,
    /// Mount the host's docker credentials into the helper container
    #[serde(default)]
    pub credentials: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_path")]
    pub path: String,
    pub port: Option<u16>,
    #[serde(default = "default_health_host")]
    pub host: String,
    #[serde(default = "default_health_scheme")]
    pub scheme: String,
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
    #[serde(default = "default_health_start_period")]
    pub start_period: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_health_path(),
            port: None,
            host: default_health_host(),
            scheme: default_health_scheme(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            retries: default_health_retries(),
            start_period: default_health_start_period(),
        }
    }
}

fn default_health_path() -> String {
    "/".to_string()
}
fn default_health_host() -> String {
    "localhost".to_string()
}
fn default_health_scheme() -> String {
    "http".to_string()
}
fn default_health_interval() -> u64 {
    5
}
fn default_health_timeout() -> u64 {
    5
}
fn default_health_retries() -> u32 {
    10
}
fn default_health_start_period() -> u64 {
    5
}

/// Progressive traffic shifting settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_canary_steps")]
    pub steps: Vec<u8>,
    /// Seconds between ticks
    #[serde(default = "default_step_duration")]
    pub step_duration: u64,
    /// 5xx lines within the log window that make a tick fail
    #[serde(default = "default_error_threshold")]
    pub error_threshold: usize,
    /// Seconds of canary logs sampled per tick
    #[serde(default = "default_log_window")]
    pub log_window: u64,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            steps: default_canary_steps(),
            step_duration: default_step_duration(),
            error_threshold: default_error_threshold(),
            log_window: default_log_window(),
        }
    }
}

fn default_canary_steps() -> Vec<u8> {
    vec![10, 25, 50, 100]
}
fn default_step_duration() -> u64 {
    60
}
fn default_error_threshold() -> usize {
    5
}
fn default_log_window() -> u64 {
    60
}

/// Post-deployment watchdog settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRollbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Seconds between checks
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_max_checks")]
    pub max_checks: u32,
    /// Seconds without problems after which the deployment counts as validated
    #[serde(default = "default_validation_window")]
    pub validation_window: u64,
}

impl Default for AutoRollbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_restarts: default_max_restarts(),
            check_interval: default_check_interval(),
            max_checks: default_max_checks(),
            validation_window: default_validation_window(),
        }
    }
}

fn default_max_restarts() -> u32 {
    3
}
fn default_check_interval() -> u64 {
    10
}
fn default_max_checks() -> u32 {
    30
}
fn default_validation_window() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    #[serde(default = "default_true")]
    pub build_cache: bool,
    #[serde(default)]
    pub consistent_container_name: bool,
    pub custom_internal_name: Option<String>,
    #[serde(default)]
    pub build_server_offload: bool,
    #[serde(default)]
    pub canary: CanaryConfig,
    #[serde(default)]
    pub auto_rollback: AutoRollbackConfig,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            build_cache: true,
            consistent_container_name: false,
            custom_internal_name: None,
            build_server_offload: false,
            canary: CanaryConfig::default(),
            auto_rollback: AutoRollbackConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
    /// Available while building the image
    #[serde(default)]
    pub build_time: bool,
    /// Available to the running container
    #[serde(default = "default_true")]
    pub runtime: bool,
    /// Only used for pull request previews
    #[serde(default)]
    pub preview: bool,
}

/// Configuration snapshot of a deployable application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: u64,
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub team_id: u64,
    pub server_id: u64,
    /// Docker network the containers join
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub additional_servers: Vec<u64>,
    pub build_pack: BuildPack,
    pub git: Option<GitSource>,
    #[serde(default = "default_base_directory")]
    pub base_directory: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile_location: String,
    #[serde(default = "default_compose_location")]
    pub compose_location: String,
    #[serde(default = "default_base_directory")]
    pub publish_directory: String,
    /// Prebuilt image for the `image` buildpack, with tag
    pub docker_image: Option<String>,
    pub registry: Option<RegistryConfig>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host port mappings, `host:container`
    #[serde(default)]
    pub port_mappings: Vec<String>,
    pub fqdn: Option<String>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub settings: ApplicationSettings,
    pub pre_deployment_command: Option<String>,
    pub post_deployment_command: Option<String>,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    #[serde(default)]
    pub watch_paths: Vec<String>,
    /// Hash of the configuration last deployed
    #[serde(default)]
    pub config_hash: Option<String>,
}

fn default_network() -> String {
    "berth".to_string()
}
fn default_base_directory() -> String {
    "/".to_string()
}
fn default_dockerfile() -> String {
    "/Dockerfile".to_string()
}
fn default_compose_location() -> String {
    "/docker-compose.yaml".to_string()
}
fn default_port() -> u16 {
    3000
}

#[derive(Serialize)]
struct HashedConfig<'a> {
    build_pack: BuildPack,
    git: &'a Option<GitSource>,
    base_directory: &'a str,
    dockerfile_location: &'a str,
    compose_location: &'a str,
    publish_directory: &'a str,
    docker_image: &'a Option<String>,
    port: u16,
    port_mappings: &'a [String],
    fqdn: &'a Option<String>,
    health_check: &'a HealthCheckConfig,
    custom_internal_name: &'a Option<String>,
    environment: Vec<(&'a str, &'a str, bool, bool)>,
}

impl Application {
    /// Container name without the per-release suffix.
    pub fn container_base_name(&self, pull_request_id: u64) -> String {
        if pull_request_id > 0 {
            format!("{}-pr-{}", self.uuid, pull_request_id)
        } else {
            self.uuid.clone()
        }
    }

    pub fn health_port(&self) -> u16 {
        self.health_check.port.unwrap_or(self.port)
    }

    /// Rolling updates need old and new containers side by side.
    /// Compose projects are recreated in place, so they never run old and new side by side.
    pub fn supports_rolling_update(&self, pull_request_id: u64) -> bool {
        !(self.build_pack == BuildPack::Compose
            || self.settings.consistent_container_name
            || self.settings.custom_internal_name.is_some()
            || pull_request_id > 0
            || !self.port_mappings.is_empty())
    }

    /// Variables applicable to a deployment, preview overrides applied.
    pub fn env_for(&self, pull_request_id: u64) -> Vec<&EnvVar> {
        let is_preview = pull_request_id > 0;
        let mut vars: Vec<&EnvVar> = Vec::new();
        for var in self.environment.iter().filter(|v| !v.preview || is_preview) {
            if let Some(existing) = vars.iter_mut().find(|v| v.key == var.key) {
                if var.preview {
                    *existing = var;
                }
            } else {
                vars.push(var);
            }
        }
        vars
    }

    /// SHA-256 over everything that changes what gets deployed.
    pub fn configuration_hash(&self, pull_request_id: u64) -> String {
        let mut environment: Vec<_> = self
            .env_for(pull_request_id)
            .into_iter()
            .map(|v| (v.key.as_str(), v.value.as_str(), v.build_time, v.runtime))
            .collect();
        environment.sort();

        let hashed = HashedConfig {
            build_pack: self.build_pack,
            git: &self.git,
            base_directory: &self.base_directory,
            dockerfile_location: &self.dockerfile_location,
            compose_location: &self.compose_location,
            publish_directory: &self.publish_directory,
            docker_image: &self.docker_image,
            port: self.port,
            port_mappings: &self.port_mappings,
            fqdn: &self.fqdn,
            health_check: &self.health_check,
            custom_internal_name: &self.settings.custom_internal_name,
            environment,
        };

        let encoded = serde_json::to_vec(&hashed).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }
}
