pub mod cli;
pub mod compose;
pub mod config;
pub mod deploy;
pub mod engine;
pub mod integrations;
pub mod model;
pub mod monitor;
pub mod output;
pub mod remote;
pub mod rollout;
pub mod ssh;
pub mod store;
pub mod traefik;

#[cfg(test)]
mod testing;
