use serde::{Deserialize, Serialize};

/// A remote Docker host reachable over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub address: String,
    #[serde(default = "default_user")]
    pub user: String,
    pub port: Option<u16>,
    /// Jump host, passed through to ssh as-is
    pub proxy: Option<String>,
    #[serde(default)]
    pub team_id: u64,
    /// Tagged as build-capable; eligible for build offload
    #[serde(default)]
    pub build_server: bool,
    /// Whether the edge proxy runs on this host
    #[serde(default = "default_true")]
    pub proxy_enabled: bool,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_true() -> bool {
    true
}

impl Server {
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.address)
    }
}
