use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ExecOptions, ExecOutput, RemoteError, RemoteExecutor};
use crate::model::Server;
use crate::ssh::MuxPool;

/// Executor backed by real SSH connections.
pub struct SshExecutor {
    pool: Arc<MuxPool>,
}

impl SshExecutor {
    pub fn new(pool: Arc<MuxPool>) -> Self {
        Self { pool }
    }
}

fn transport(server: &Server, err: anyhow::Error) -> RemoteError {
    RemoteError::Transport {
        server: server.label(),
        message: format!("{:#}", err),
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(
        &self,
        server: &Server,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecOutput, RemoteError> {
        let run = async {
            if options.disable_multiplexing {
                debug!("Running on {} without multiplexing", server.address);
                let session = self.pool.one_off(server).await?;
                let output = session.run(command).await;
                if let Err(e) = session.close().await {
                    debug!("Closing one-off session to {} failed: {:#}", server.address, e);
                }
                output
            } else {
                let session = self.pool.session(server).await?;
                session.run(command).await
            }
        };

        match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result.map_err(|e| transport(server, e)),
                Err(_) => Err(RemoteError::Timeout {
                    server: server.label(),
                    command: command.to_string(),
                    timeout: limit,
                }),
            },
            None => run.await.map_err(|e| transport(server, e)),
        }
    }
}
