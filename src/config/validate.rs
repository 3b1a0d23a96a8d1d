use anyhow::{bail, Result};
use std::collections::HashSet;

use super::BerthConfig;
use crate::model::BuildPack;

pub fn validate(config: &BerthConfig) -> Result<()> {
    let engine = &config.engine;
    if engine.workers == 0 {
        bail!("engine.workers must be at least 1");
    }
    if engine.max_attempts == 0 {
        bail!("engine.max_attempts must be at least 1");
    }
    if engine.helper_image.is_empty() {
        bail!("engine.helper_image cannot be empty");
    }
    if !engine.artifacts_dir.starts_with('/') || !engine.config_root.starts_with('/') {
        bail!("engine.artifacts_dir and engine.config_root must be absolute paths");
    }

    let mut server_ids = HashSet::new();
    for server in &config.servers {
        if !server_ids.insert(server.id) {
            bail!("Server id {} is defined more than once", server.id);
        }
        if server.address.is_empty() {
            bail!("Server '{}' has an empty address", server.name);
        }
    }

    let mut app_ids = HashSet::new();
    let mut app_names = HashSet::new();
    let mut app_uuids = HashSet::new();
    for app in &config.applications {
        if app.name.is_empty() {
            bail!("Application {} has an empty name", app.id);
        }
        if !app_ids.insert(app.id) {
            bail!("Application id {} is defined more than once", app.id);
        }
        if !app_names.insert(app.name.as_str()) {
            bail!("Application name '{}' is used more than once", app.name);
        }
        if app.uuid.is_empty() || !app_uuids.insert(app.uuid.as_str()) {
            bail!("Application '{}' needs a unique, non-empty uuid", app.name);
        }

        if !server_ids.contains(&app.server_id) {
            bail!(
                "Application '{}' targets unknown server {}",
                app.name,
                app.server_id
            );
        }
        for id in &app.additional_servers {
            if !server_ids.contains(id) {
                bail!("Application '{}' lists unknown additional server {}", app.name, id);
            }
            if *id == app.server_id {
                bail!(
                    "Application '{}' lists its primary server {} as additional",
                    app.name,
                    id
                );
            }
        }

        match app.build_pack {
            BuildPack::Image => {
                if app.docker_image.as_deref().unwrap_or("").is_empty() {
                    bail!("Application '{}' uses the image buildpack but has no docker_image", app.name);
                }
            }
            _ => {
                if app.git.as_ref().map(|g| g.repository.is_empty()).unwrap_or(true) {
                    bail!(
                        "Application '{}' uses the {} buildpack but has no git repository",
                        app.name,
                        app.build_pack
                    );
                }
            }
        }

        if app.settings.build_server_offload && app.registry.is_none() {
            bail!(
                "Application '{}' offloads builds but has no registry to move the image through",
                app.name
            );
        }

        if app.settings.build_server_offload && app.build_pack == BuildPack::Compose {
            bail!(
                "Application '{}' uses the compose buildpack, which builds on its own server; disable build_server_offload",
                app.name
            );
        }

        let canary = &app.settings.canary;
        if canary.enabled {
            if canary.steps.is_empty() {
                bail!("Application '{}' has canary enabled with no steps", app.name);
            }
            if !canary.steps.windows(2).all(|w| w[0] < w[1]) {
                bail!(
                    "Application '{}' canary steps must be strictly increasing",
                    app.name
                );
            }
            if canary.steps.last() != Some(&100) {
                bail!("Application '{}' canary steps must end at 100", app.name);
            }
        }

        for var in &app.environment {
            if var.key.is_empty() || var.key.contains('=') || var.key.contains(char::is_whitespace) {
                bail!(
                    "Application '{}' has an invalid environment variable name '{}'",
                    app.name,
                    var.key
                );
            }
        }
    }

    Ok(())
}
