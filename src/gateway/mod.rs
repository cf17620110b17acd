//! Tool-server gateway: registry, health tracking, routing and insights.
//!
//! The gateway fronts a dynamic pool of independently hosted tool servers.
//! Servers register (or are discovered), are probed on a jittered interval,
//! and have their declared tools indexed in a catalog. Invocations name a
//! tool; the router picks a provider through a pluggable strategy, fails
//! over on transient errors and records the outcome in sharded rolling
//! windows that feed an advisory anomaly and optimization feed.
//!
//! The module follows hexagonal architecture:
//!
//! - Domain types in [`domain`]
//! - Port contracts in [`ports`]
//! - Adapter implementations in [`adapters`]
//! - Orchestration services in [`services`]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod services;
