//! toolbridge connects a chat agent to external tool servers and streams the
//! agent's answer back to HTTP clients.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`server`] describes tool servers (local subprocess streams or remote HTTP
//!   endpoints), their advertised tools, and the registry that owns them.
//! - [`executor`] invokes a named tool on one server, correlating local
//!   responses by request id and normalizing every failure into [`error`].
//! - [`instrument`] turns a server's catalog into function definitions and
//!   callables for the model, merged with tools from other providers.
//! - [`stream`] forwards a streamed answer as framed NDJSON records with
//!   backpressure while capturing the full text.
//!
//! [`config`], [`logging`] and [`cli`] back the `toolbridge` binary.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod instrument;
pub mod logging;
pub mod server;
pub mod stream;

pub use error::{BridgeError, BridgeResult, ErrorKind};
