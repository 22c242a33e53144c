//! Core types, config, errors, wire protocol, and transcript model for CarBot.

pub mod config;
pub mod context;
pub mod error;
pub mod protocol;
pub mod sse;
pub mod transcript;
pub mod types;
