//! HTTP API
//!
//! The axum surface over the lifecycle manager. Handlers translate between
//! wire payloads and manager calls; all state lives in the manager.

mod error;
pub mod handlers;
mod router;

pub use error::{failure, ApiFailure, ApiResult};
pub use router::create_router;
