use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::model::{Application, Server};

mod validate;

pub use validate::validate;

#[derive(Debug, Deserialize, Serialize)]
pub struct BerthConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub applications: Vec<Application>,
}

/// The `[engine]` table. Durations are in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_deployment_timeout")]
    pub deployment_timeout: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: Vec<u64>,
    #[serde(default = "default_lock_retry_delay")]
    pub lock_retry_delay: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
    #[serde(default = "default_config_root")]
    pub config_root: String,
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout: u64,
    #[serde(default = "default_helper_stop_timeout")]
    pub helper_stop_timeout: u64,
    #[serde(default)]
    pub ssh: SshConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deployment_timeout: default_deployment_timeout(),
            max_attempts: default_max_attempts(),
            retry_backoff: default_retry_backoff(),
            lock_retry_delay: default_lock_retry_delay(),
            workers: default_workers(),
            helper_image: default_helper_image(),
            artifacts_dir: default_artifacts_dir(),
            config_root: default_config_root(),
            health_poll_interval: default_health_poll_interval(),
            health_timeout: default_health_timeout(),
            helper_stop_timeout: default_helper_stop_timeout(),
            ssh: SshConfig::default(),
        }
    }
}

fn default_deployment_timeout() -> u64 {
    3600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> Vec<u64> {
    vec![30, 60, 120]
}
fn default_lock_retry_delay() -> u64 {
    30
}
fn default_workers() -> usize {
    4
}
fn default_helper_image() -> String {
    "ghcr.io/berth-dev/helper:latest".to_string()
}
fn default_artifacts_dir() -> String {
    "/artifacts".to_string()
}
fn default_config_root() -> String {
    "/data/berth".to_string()
}
fn default_health_poll_interval() -> u64 {
    2
}
fn default_health_timeout() -> u64 {
    300
}
fn default_helper_stop_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_mux_max_persist")]
    pub mux_max_persist: u64,
    #[serde(default = "default_mux_idle_timeout")]
    pub mux_idle_timeout: u64,
    #[serde(default = "default_mux_sweep_interval")]
    pub mux_sweep_interval: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            mux_max_persist: default_mux_max_persist(),
            mux_idle_timeout: default_mux_idle_timeout(),
            mux_sweep_interval: default_mux_sweep_interval(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_mux_max_persist() -> u64 {
    3600
}
fn default_mux_idle_timeout() -> u64 {
    600
}
fn default_mux_sweep_interval() -> u64 {
    60
}

impl SshConfig {
    pub fn mux_settings(&self) -> crate::ssh::MuxSettings {
        crate::ssh::MuxSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            max_persist: Duration::from_secs(self.mux_max_persist),
            idle_timeout: Duration::from_secs(self.mux_idle_timeout),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.mux_sweep_interval)
    }
}

impl BerthConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        validate::validate(&config)?;

        Ok(config)
    }

    pub fn server(&self, id: u64) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BuildPack;
    use std::io::Write;

    const SAMPLE: &str = r#"
[engine]
workers = 2
retry_backoff = [5, 10]

[engine.ssh]
mux_idle_timeout = 120

[[servers]]
id = 1
name = "edge-1"
address = "10.0.0.10"

[[servers]]
id = 2
name = "builder"
address = "10.0.0.20"
build_server = true

[[applications]]
id = 1
uuid = "shop"
name = "shop"
server_id = 1
build_pack = "dockerfile"
fqdn = "https://shop.example.com"

[applications.git]
repository = "git@github.com:acme/shop.git"

[[applications.environment]]
key = "DATABASE_URL"
value = "postgres://db/shop"

[applications.settings.canary]
enabled = true
steps = [20, 100]
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_fleet_and_engine_settings() {
        let file = write_config(SAMPLE);
        let config = BerthConfig::load(file.path()).unwrap();

        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.retry_backoff, vec![5, 10]);
        assert_eq!(config.engine.deployment_timeout, 3600);
        assert_eq!(config.engine.ssh.mux_idle_timeout, 120);
        assert_eq!(config.engine.ssh.mux_max_persist, 3600);

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].user, "root");
        assert!(config.servers[1].build_server);

        let app = &config.applications[0];
        assert_eq!(app.name, "shop");
        assert_eq!(app.build_pack, BuildPack::Dockerfile);
        assert_eq!(app.git.as_ref().unwrap().branch, "main");
        assert!(app.settings.build_cache);
        assert!(app.environment[0].runtime);
        assert_eq!(app.settings.canary.steps, vec![20, 100]);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let file = write_config("");
        let config = BerthConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.lock_retry_delay, 30);
        assert_eq!(config.engine.artifacts_dir, "/artifacts");
        assert!(config.applications.is_empty());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = BerthConfig::load(Path::new("/nonexistent/berth.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/berth.toml"));
    }

    #[test]
    fn servers_are_looked_up_by_id() {
        let file = write_config(SAMPLE);
        let config = BerthConfig::load(file.path()).unwrap();
        assert_eq!(config.server(2).map(|s| s.name.as_str()), Some("builder"));
        assert!(config.server(9).is_none());
    }
}
