//! Connection and repository registries
//!
//! Pure state containers. Every write to a single row is atomic; the
//! lifecycle manager decides which writes happen and in what order.

mod connections;
mod repositories;

pub use connections::{ConnectionRegistry, NewConnection, StatusChange};
pub use repositories::RepositoryRegistry;
