//! MCP (Model Context Protocol) client: JSON-RPC protocol types, stdio and
//! HTTP transports, the configuration-snapshot registry, and the per-turn
//! toolset.
//!
//! Connections are deliberately per-turn: a toolset is constructed fresh
//! for every turn and shut down with it, so stale server processes never
//! accumulate behind a long-lived cache. Only *configuration* is cached,
//! in [`registry::McpRegistry`].

pub mod protocol;
pub mod registry;
pub mod toolset;
pub mod transport;

pub use registry::{ConfigSnapshot, McpRegistry};
pub use toolset::McpToolset;
