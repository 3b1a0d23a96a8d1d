//! Edge-proxy control through Traefik's file provider.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use minijinja::Environment;
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{Application, Server};
use crate::remote::{self, ExecOptions, RemoteCommand, RemoteExecutor};

const ROUTE_TEMPLATE: &str = include_str!("../../templates/traefik-route.yaml.j2");

pub const PROXY_CONTAINER: &str = "berth-proxy";

/// A public route to one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Router and service name
    pub name: String,
    pub host: String,
    pub tls: bool,
    pub port: u16,
}

impl Route {
    /// `None` when the application has no public domain.
    pub fn for_application(app: &Application, pull_request_id: u64) -> Option<Self> {
        let fqdn = app.fqdn.as_deref()?;
        let (tls, host) = match fqdn.split_once("://") {
            Some((scheme, rest)) => (scheme == "https", rest),
            None => (false, fqdn),
        };
        let host = host.trim_end_matches('/');
        let host = if pull_request_id > 0 {
            format!("pr-{}.{}", pull_request_id, host)
        } else {
            host.to_string()
        };
        Some(Self {
            name: app.container_base_name(pull_request_id),
            host,
            tls,
            port: app.port,
        })
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.host)
    }
}

#[async_trait]
pub trait ProxyController: Send + Sync {
    /// Send all traffic for `route` to `container`.
    async fn set_upstream(&self, server: &Server, route: &Route, container: &str) -> Result<()>;

    /// Split traffic; weights are percentages summing to 100.
    async fn set_weighted_upstream(
        &self,
        server: &Server,
        route: &Route,
        upstreams: &[(String, u8)],
    ) -> Result<()>;

    /// Re-apply the route for `container` and check the proxy is running.
    async fn resync(&self, server: &Server, route: &Route, container: &str) -> Result<()>;
}

#[derive(Serialize)]
struct Upstream<'a> {
    container: &'a str,
    weight: u8,
}

pub fn render_route(route: &Route, upstreams: &[(String, u8)]) -> Result<String> {
    let total: u32 = upstreams.iter().map(|(_, w)| u32::from(*w)).sum();
    if upstreams.is_empty() || total != 100 {
        bail!("Upstream weights for {} must sum to 100, got {}", route.name, total);
    }

    let live: Vec<Upstream> = upstreams
        .iter()
        .filter(|(_, w)| *w > 0)
        .map(|(c, w)| Upstream {
            container: c,
            weight: *w,
        })
        .collect();

    let mut env = Environment::new();
    env.add_template("route", ROUTE_TEMPLATE)
        .context("Failed to load route template")?;
    let tmpl = env.get_template("route")?;

    let rendered = tmpl
        .render(minijinja::context! {
            name => &route.name,
            host => &route.host,
            tls => route.tls,
            entrypoint => if route.tls { "https" } else { "http" },
            port => route.port,
            weighted => live.len() > 1,
            upstreams => live,
        })
        .context("Failed to render route template")?;

    Ok(rendered)
}

/// Writes one dynamic-configuration file per route; Traefik watches the directory.
pub struct TraefikProxy {
    executor: Arc<dyn RemoteExecutor>,
    dynamic_dir: String,
}

impl TraefikProxy {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config_root: &str) -> Self {
        Self {
            executor,
            dynamic_dir: format!("{}/proxy/dynamic", config_root),
        }
    }

    fn route_path(&self, route: &Route) -> String {
        format!("{}/{}.yaml", self.dynamic_dir, route.name)
    }

    async fn write_route(&self, server: &Server, route: &Route, upstreams: &[(String, u8)]) -> Result<()> {
        if !server.proxy_enabled {
            debug!("Proxy disabled on {}, not routing {}", server.name, route.name);
            return Ok(());
        }
        let content = render_route(route, upstreams)?;
        remote::execute(
            self.executor.as_ref(),
            server,
            &[RemoteCommand::new(remote::write_file(&self.route_path(route), &content))],
            &ExecOptions::default(),
            None,
        )
        .await
        .with_context(|| format!("Failed to write route for {}", route.name))?;
        Ok(())
    }
}

#[async_trait]
impl ProxyController for TraefikProxy {
    async fn set_upstream(&self, server: &Server, route: &Route, container: &str) -> Result<()> {
        self.write_route(server, route, &[(container.to_string(), 100)])
            .await
    }

    async fn set_weighted_upstream(
        &self,
        server: &Server,
        route: &Route,
        upstreams: &[(String, u8)],
    ) -> Result<()> {
        self.write_route(server, route, upstreams).await
    }

    async fn resync(&self, server: &Server, route: &Route, container: &str) -> Result<()> {
        if !server.proxy_enabled {
            return Ok(());
        }
        let running = remote::execute(
            self.executor.as_ref(),
            server,
            &[RemoteCommand::new(format!(
                "docker ps -q --filter name=^{}$ --filter status=running",
                PROXY_CONTAINER
            ))],
            &ExecOptions::default(),
            None,
        )
        .await?;
        if running.trim().is_empty() {
            warn!("Proxy container is not running on {}", server.name);
        }
        self.set_upstream(server, route, container).await
    }
}
