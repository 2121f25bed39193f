//! # Dripwise Core
//!
//! Shared foundation for the Dripwise automation platform: the error type,
//! configuration, domain types exchanged with collaborators, and the traits
//! those collaborators implement (action runner, billing, messaging, templates).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::DripConfig;
pub use error::{DripError, Result};
