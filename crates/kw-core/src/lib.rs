//! kw-core: Core types, errors and configuration for keyward
//!
//! This crate provides the domain records (system key, connections,
//! storage telemetry, repository references), the error taxonomy and the
//! HTTP payload types shared by the daemon and its tests.

pub mod api;
pub mod config;
pub mod error;
pub mod format;
pub mod types;

pub use error::KwError;
pub use types::{ConnectionId, ConnectionStatus, KeyId, KeyType, RepositoryId};
