//! Transport module - platform-specific pipe/socket handling.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)
//!
//! Stubs and skels accept any `AsyncRead`/`AsyncWrite` pair; these helpers
//! only cover the common case of two local processes.

mod pipe;

pub use pipe::{generate_pipe_path, PipeListener, PipeStream};
