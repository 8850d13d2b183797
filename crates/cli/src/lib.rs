//! Command-line entry points and the HTTP/WebSocket server for droidplane.

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod server;
