//! HTTP server for CarBot.
//!
//! Accepts a client transcript on `POST /api/chat`, runs one orchestrated
//! turn, and streams the turn back as Server-Sent Events.

pub mod chat;
pub mod server;
pub mod state;
pub mod transport;

pub use server::{build_router, resolve_port, start_server};
pub use state::AppState;
