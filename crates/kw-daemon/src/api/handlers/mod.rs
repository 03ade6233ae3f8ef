//! HTTP request handlers

pub mod connections;
pub mod keys;
pub mod repositories;
