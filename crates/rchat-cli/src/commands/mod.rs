//! CLI command implementations.

pub mod chat;
