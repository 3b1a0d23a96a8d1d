use std::error::Error as _;
use std::time::Duration;

use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Deployment cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Failed to push {image} to the registry")]
    RegistryPush {
        image: String,
        #[source]
        source: RemoteError,
    },

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Container {container} did not become healthy: {reason}")]
    HealthCheck { container: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Deployment exceeded its {}s limit", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DeployError {
    /// Stable identifier shown in the failure block.
    pub fn code(&self) -> &'static str {
        match self {
            DeployError::Cancelled => "cancelled",
            DeployError::Remote(RemoteError::Transport { .. }) => "transport_error",
            DeployError::Remote(RemoteError::CommandFailed { .. }) => "remote_command_failed",
            DeployError::Remote(RemoteError::Timeout { .. }) => "remote_command_timeout",
            DeployError::RegistryPush { .. } => "registry_push_failed",
            DeployError::Build(_) => "build_failed",
            DeployError::HealthCheck { .. } => "health_check_failed",
            DeployError::Configuration(_) => "configuration_invalid",
            DeployError::Timeout(_) => "deployment_timeout",
            DeployError::Internal(_) => "internal_error",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::Cancelled => "Cancelled",
            DeployError::Remote(_) => "RemoteError",
            DeployError::RegistryPush { .. } => "RegistryPushError",
            DeployError::Build(_) => "BuildError",
            DeployError::HealthCheck { .. } => "HealthCheckError",
            DeployError::Configuration(_) => "ConfigurationError",
            DeployError::Timeout(_) => "TimeoutError",
            DeployError::Internal(_) => "InternalError",
        }
    }

    /// Only an unreachable host is worth another job attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::Remote(e) if e.is_transport())
    }

    /// Messages of the underlying causes, outermost first.
    pub fn causes(&self) -> Vec<String> {
        if let DeployError::Internal(e) = self {
            return e.chain().skip(1).map(|c| c.to_string()).collect();
        }
        let mut causes = Vec::new();
        let mut source = self.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        causes
    }

    /// Leading frames of the captured backtrace, if one was captured.
    pub fn frames(&self, limit: usize) -> Vec<String> {
        let DeployError::Internal(e) = self else {
            return Vec::new();
        };
        let backtrace = e.backtrace();
        if backtrace.status() != std::backtrace::BacktraceStatus::Captured {
            return Vec::new();
        }
        backtrace
            .to_string()
            .lines()
            .filter(|l| {
                let l = l.trim_start();
                l.split_once(':')
                    .map(|(n, _)| n.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
            .take(limit)
            .map(|l| l.trim().to_string())
            .collect()
    }
}

/// Rewraps a failed remote command as a build failure; transport errors stay as they are.
pub fn build_failure(err: RemoteError) -> DeployError {
    match err {
        RemoteError::CommandFailed { .. } => DeployError::Build(err.to_string()),
        other => DeployError::Remote(other),
    }
}
