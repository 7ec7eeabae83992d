//! # Error Handling
//!
//! Error types shared by every flowgate subsystem. The admin client keeps its own
//! error type in [`crate::client`].

pub mod types;

pub use types::{GatewayError, Result};
