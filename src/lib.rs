// ABOUTME: Library root for the B2C instance deployment and migration toolkit
// ABOUTME: Exposes the remote access layer and the migration, feature and code engines

pub mod archive;
pub mod cli;
pub mod code;
pub mod config;
pub mod error;
pub mod features;
pub mod migrations;
pub mod permissions;
pub mod remote;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use error::ToolkitError;
