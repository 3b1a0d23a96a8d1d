use std::sync::Arc;

use tracing::{debug, warn};

use crate::model::{LogStream, NewLogEntry};
use crate::store::Store;

/// Append-only log of one deployment.
///
/// Writes never fail the caller; a store error is reported through tracing.
#[derive(Clone)]
pub struct DeploymentLog {
    store: Arc<dyn Store>,
    uuid: String,
}

impl DeploymentLog {
    pub fn new(store: Arc<dyn Store>, uuid: impl Into<String>) -> Self {
        Self {
            store,
            uuid: uuid.into(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub async fn line(&self, text: impl Into<String>, stream: LogStream, hidden: bool, batch: u32) {
        let text = text.into();
        debug!(deployment = %self.uuid, ?stream, hidden, "{}", text);
        let entry = NewLogEntry {
            text,
            stream,
            hidden,
            batch,
        };
        if let Err(e) = self.store.append_log(&self.uuid, entry).await {
            warn!("Failed to append log line to {}: {:#}", self.uuid, e);
        }
    }

    pub async fn info(&self, text: impl Into<String>) {
        self.line(text, LogStream::Info, false, 0).await;
    }

    pub async fn warning(&self, text: impl Into<String>) {
        self.line(text, LogStream::Warning, false, 0).await;
    }

    /// Debug-only detail, hidden from the default view.
    pub async fn debug(&self, text: impl Into<String>) {
        self.line(text, LogStream::Info, true, 0).await;
    }
}
