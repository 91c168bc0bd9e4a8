//! Casino HTTP API
//!
//! Request/response surface over the settlement engine, sessions and the
//! fair-play registry.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::ApiServer;
