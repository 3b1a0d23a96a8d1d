use anyhow::{Context, Result};
use tracing::trace;

use super::SshSession;
use crate::remote::ExecOutput;

impl SshSession {
    /// Run a command through `bash -c` and capture its output.
    ///
    /// A nonzero exit is not an error here; the caller decides.
    pub async fn run(&self, cmd: &str) -> Result<ExecOutput> {
        trace!("[{}] run: {}", self.host, cmd);

        let output = self
            .session
            .command("bash")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .with_context(|| format!("Failed to execute command on {}", self.host))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }
}
