//! Multiplexed SSH connections, one per server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::SshSession;
use crate::model::Server;

#[derive(Debug, Clone)]
pub struct MuxSettings {
    pub connect_timeout: Duration,
    /// Sessions older than this are closed even when busy
    pub max_persist: Duration,
    pub idle_timeout: Duration,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_persist: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepReason {
    Orphaned,
    Expired,
    Idle,
    Dead,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub closed: Vec<(u64, SweepReason)>,
    pub kept: usize,
}

impl SweepReason {
    pub fn label(self) -> &'static str {
        match self {
            SweepReason::Orphaned => "orphaned",
            SweepReason::Expired => "expired",
            SweepReason::Idle => "idle",
            SweepReason::Dead => "dead",
        }
    }
}

struct Pooled {
    session: Arc<SshSession>,
    created_at: Instant,
    last_used: Instant,
}

/// Decide whether a pooled connection should go, without touching the network.
pub fn classify(
    settings: &MuxSettings,
    server_known: bool,
    created_at: Instant,
    last_used: Instant,
    now: Instant,
) -> Option<SweepReason> {
    if !server_known {
        return Some(SweepReason::Orphaned);
    }
    if now.duration_since(created_at) >= settings.max_persist {
        return Some(SweepReason::Expired);
    }
    if now.duration_since(last_used) >= settings.idle_timeout {
        return Some(SweepReason::Idle);
    }
    None
}

pub struct MuxPool {
    settings: MuxSettings,
    sessions: Mutex<HashMap<u64, Pooled>>,
}

impl MuxPool {
    pub fn new(settings: MuxSettings) -> Self {
        Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Shared session for `server`, connecting on first use.
    pub async fn session(&self, server: &Server) -> Result<Arc<SshSession>> {
        let now = Instant::now();
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(pooled) = sessions.get_mut(&server.id) {
                if now.duration_since(pooled.created_at) < self.settings.max_persist {
                    pooled.last_used = now;
                    return Ok(pooled.session.clone());
                }
                debug!("Mux connection to {} past max persist, reconnecting", server.address);
                sessions.remove(&server.id);
            }
        }

        let session = Arc::new(SshSession::connect(server, self.settings.connect_timeout).await?);

        let mut sessions = self.sessions.lock().await;
        let pooled = sessions.entry(server.id).or_insert_with(|| Pooled {
            session: session.clone(),
            created_at: now,
            last_used: now,
        });
        Ok(pooled.session.clone())
    }

    /// Connection that bypasses the pool; the caller closes it.
    pub async fn one_off(&self, server: &Server) -> Result<SshSession> {
        SshSession::connect(server, self.settings.connect_timeout).await
    }

    /// Close connections that are orphaned, expired, idle or dead.
    pub async fn sweep(&self, known_servers: &[u64]) -> SweepReport {
        let now = Instant::now();
        let mut doomed: Vec<(u64, SweepReason, Arc<SshSession>)> = Vec::new();
        let mut survivors: Vec<(u64, Arc<SshSession>)> = Vec::new();

        {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<u64> = sessions.keys().copied().collect();
            for id in ids {
                let Some(pooled) = sessions.get(&id) else {
                    continue;
                };
                let known = known_servers.contains(&id);
                let verdict = classify(&self.settings, known, pooled.created_at, pooled.last_used, now);
                let session = pooled.session.clone();
                match verdict {
                    Some(reason) => {
                        sessions.remove(&id);
                        doomed.push((id, reason, session));
                    }
                    None => survivors.push((id, session)),
                }
            }
        }

        let mut report = SweepReport::default();
        for (id, session) in survivors {
            if session.is_alive().await {
                report.kept += 1;
            } else {
                let mut sessions = self.sessions.lock().await;
                if let Some(pooled) = sessions.remove(&id) {
                    doomed.push((id, SweepReason::Dead, pooled.session));
                }
            }
        }

        for (id, reason, session) in doomed {
            info!("Closing {} mux connection to server {}", reason.label(), id);
            // Still borrowed by an in-flight command: dropped when it finishes.
            if let Ok(session) = Arc::try_unwrap(session) {
                if let Err(e) = session.close().await {
                    debug!("Closing mux connection to server {} failed: {:#}", id, e);
                }
            }
            report.closed.push((id, reason));
        }

        report
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
