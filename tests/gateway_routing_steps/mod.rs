//! Step definitions for gateway routing BDD scenarios.

mod given;
mod then;
mod when;
pub mod world;
