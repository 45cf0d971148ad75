//! CLI command implementations.

pub mod auto;
pub mod init;
pub mod join;
pub mod project;
pub mod serve;
pub mod session;
