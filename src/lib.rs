//! Tenantgate - a reverse proxy that starts tenant workers on demand
//!
//! This library provides a header-routed proxy that:
//! - Extracts a tenant key from a configured request header via a capture regex
//! - Assigns each tenant a stable id that doubles as its worker's TCP port
//! - Spawns one worker process per tenant on first traffic, with templated
//!   arguments and an isolated environment
//! - Probes workers for readiness and coordinates concurrent requests while a
//!   worker starts
//! - Proxies traffic through a cached per-tenant reverse proxy over a shared
//!   connection pool
//! - Hard-kills workers after a configurable idle timeout and recycles the
//!   tenant slot when a worker dies

pub mod config;
pub mod error;
pub mod manager;
pub mod probe;
pub mod router;
pub mod template;
pub mod upstream;
pub mod worker;

/// Package name
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
