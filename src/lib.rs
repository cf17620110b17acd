//! Toolmesh: a gateway for pools of independently hosted tool servers.
//!
//! This crate discovers, health-checks, catalogs and load-balances calls
//! across tool servers, each exposing named, remotely invokable tools.
//!
//! # Architecture
//!
//! Toolmesh follows hexagonal architecture principles:
//!
//! - **Domain**: Server records, tool descriptors, status machine and
//!   advisory records, with no infrastructure dependencies
//! - **Ports**: The transport trait every tool-server protocol implements
//! - **Adapters**: HTTP, persistent TCP channel and in-memory transports
//!
//! # Modules
//!
//! - [`gateway`]: Registry, health monitor, router, metrics and insights
//! - [`config`]: JSON configuration loading and validation

pub mod config;
pub mod gateway;
