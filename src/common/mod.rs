//! Common utilities and shared functionality
//!
//! Value types and the time source used across the fairstake engine.

pub mod clock;
pub mod types;
