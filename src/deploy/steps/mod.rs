//! Pipeline stages, in execution order.

pub mod build;
pub mod cleanup;
pub mod configure;
pub mod post_deploy;
pub mod prepare;
pub mod registry;
pub mod source;
