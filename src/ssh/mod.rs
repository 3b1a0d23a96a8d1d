pub mod exec;
pub mod pool;

use anyhow::{Context, Result};
use openssh::{KnownHosts, Session, SessionBuilder};
use std::time::Duration;
use tracing::debug;

use crate::model::Server;

pub use pool::{MuxPool, MuxSettings};

pub struct SshSession {
    session: Session,
    host: String,
}

impl SshSession {
    pub async fn connect(server: &Server, connect_timeout: Duration) -> Result<Self> {
        if let Some(jump) = &server.proxy {
            debug!("Connecting to {}@{} via proxy {}", server.user, server.address, jump);
        } else {
            debug!("Connecting to {}@{}", server.user, server.address);
        }

        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        builder.user(server.user.clone());
        builder.connect_timeout(connect_timeout);
        builder.server_alive_interval(Duration::from_secs(30));

        if let Some(port) = server.port {
            builder.port(port);
        }

        if let Some(jump) = &server.proxy {
            builder.jump_hosts([jump]);
        }

        let session = builder
            .connect(&server.address)
            .await
            .with_context(|| format!("Failed to connect to {}@{}", server.user, server.address))?;

        Ok(Self {
            session,
            host: server.address.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether the control connection still answers.
    pub async fn is_alive(&self) -> bool {
        self.session.check().await.is_ok()
    }

    pub async fn close(self) -> Result<()> {
        self.session
            .close()
            .await
            .with_context(|| format!("Failed to close SSH session to {}", self.host))?;
        Ok(())
    }
}
