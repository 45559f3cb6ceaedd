//! deckterm application library
//!
//! CLI, configuration, logging and the HTTP/streaming server wired around
//! the terminal session manager.

pub use deckterm_client as client;
pub use deckterm_terminal as terminal;
pub use deckterm_types as types;

pub mod attach;
pub mod cli;
pub mod config;
pub mod logging;
pub mod web;

pub use cli::{AttachArgs, Cli, Commands, IdentityMode, LogFormat, ServeArgs};
pub use config::{FileConfig, IdentityConfig, LoggingConfig, ServerConfig, UpstreamConfig};
pub use web::WebServer;
