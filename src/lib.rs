// src/lib.rs
pub mod auth;
pub mod command;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod lock_monitor;
pub mod nonce;
pub mod registry;
pub mod relay;
pub mod session;
pub mod transport;
pub mod types;
pub mod unlock;

pub use error::{AuthError, Error, Result};
