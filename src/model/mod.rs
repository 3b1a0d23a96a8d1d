pub mod application;
pub mod deployment;
pub mod rollback;
pub mod server;

pub use application::{Application, BuildPack, EnvVar};
pub use deployment::{
    ApprovalStatus, DeploymentRecord, DeploymentRequest, DeploymentStatus, LogEntry, LogStream,
    NewLogEntry,
};
pub use rollback::{
    MetricsSnapshot, NewRollbackEvent, RollbackEvent, RollbackStatus, TriggerReason, TriggerType,
};
pub use server::Server;
