//! code-sandbox daemon library
//!
//! Runs untrusted user programs in short-lived, resource-limited containers:
//! - Language profiles and per-execution workspaces
//! - Container runtime client (bollard) and lifecycle management
//! - Interactive-input detection, sessions for follow-up stdin, timeouts
//! - Degraded fallback execution when the runtime is unavailable
//! - HTTP and MCP surfaces over a pluggable execution backend

pub mod backend;
pub mod config;
pub mod container;
pub mod detector;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod health;
pub mod http;
pub mod language;
pub mod lesson;
pub mod mcp;
pub mod output;
pub mod runtime;
pub mod session;
pub mod workspace;
