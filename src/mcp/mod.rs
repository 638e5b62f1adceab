//! MCP Server module for deciding approvals and reading build status.
//!
//! This module provides an MCP (Model Context Protocol) server that lets an
//! assistant or operator act as the human decision channel for protected
//! writes.

pub mod server;
pub mod status;

pub use server::BuildForgeServer;
pub use status::{BuildStatus, StatusInfo, derive_status, load_status};
