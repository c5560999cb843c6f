//! `tee-engine`: a secure execution engine for off-chain function execution.
//!
//! A function is untrusted JavaScript source tied to a principal. Executing
//! it runs inside an isolated, resource-bounded QuickJS context (`sandbox`)
//! that can reach out through a small mediated capability surface (`bridge`)
//! to read the principal's secrets (`secret_store`), fetch over HTTPS, or
//! query a Neo N3 node — nothing else. `enclave` attests to the identity of
//! the code running this engine; `facade` is the one type external callers
//! construct and call.

pub mod bridge;
pub mod config;
pub mod enclave;
pub mod error;
pub mod facade;
pub mod interrupt;
pub mod isolation;
pub mod memory;
pub mod sandbox;
pub mod secret_store;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, TimeoutReason};
pub use facade::Engine;
