use anyhow::Result;

use crate::config::BerthConfig;
use crate::output;

pub fn run(config: &BerthConfig) -> Result<()> {
    output::success("Configuration is valid");

    output::header("Servers");
    if config.servers.is_empty() {
        output::warning("No servers configured");
    }
    for server in &config.servers {
        let mut line = format!("{} {}@{}", server.name, server.user, server.address);
        if server.build_server {
            line.push_str(" [build]");
        }
        if !server.proxy_enabled {
            line.push_str(" [no proxy]");
        }
        output::info(&line);
    }

    output::header("Applications");
    if config.applications.is_empty() {
        output::warning("No applications configured");
    }
    for app in &config.applications {
        let target = config
            .server(app.server_id)
            .map(|s| s.name.as_str())
            .unwrap_or("?");
        let mut line = format!("{} ({}) on {}", app.name, app.build_pack, target);
        for id in &app.additional_servers {
            if let Some(extra) = config.server(*id) {
                line.push_str(&format!(", {}", extra.name));
            }
        }
        if let Some(fqdn) = &app.fqdn {
            line.push_str(&format!(" at {}", fqdn));
        }
        if app.settings.canary.enabled {
            line.push_str(" [canary]");
        }
        if app.settings.auto_rollback.enabled {
            line.push_str(" [auto-rollback]");
        }
        output::info(&line);
    }
    Ok(())
}
