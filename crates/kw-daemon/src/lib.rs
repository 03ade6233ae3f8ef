//! kw-daemon: System SSH key and connection lifecycle manager
//!
//! The daemon owns a single system-wide SSH key, deploys its public half to
//! remote hosts, tracks per-host reachability and storage telemetry, and
//! revokes the key from every dependent when it is deleted. Clients talk to
//! it over a local HTTP API.

pub mod api;
pub mod executor;
pub mod keystore;
pub mod lifecycle;
pub mod persist;
pub mod registry;

pub use api::create_router;
pub use lifecycle::LifecycleManager;
