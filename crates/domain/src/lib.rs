//! Shared domain types for Switchboard.
//!
//! Switchboard routes inbound events from many chat channels onto a pool of
//! long-running agent sessions.  This crate holds the types every other
//! crate agrees on: the error taxonomy, the configuration tree, and the
//! provider-agnostic transcript model.

pub mod config;
pub mod error;
pub mod transcript;

pub use error::{Error, Result};
