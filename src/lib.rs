//! # riiwire
//!
//! Correlated asynchronous invocation between two processes.
//!
//! A [`Stub`] calls numbered functions exported by a [`Skel`] across any
//! byte stream (pipe, socket, in-memory duplex). Many calls may be in flight
//! at once; every response carries the id of the call that caused it, so
//! results reach the right caller whatever order the skel finishes them in.
//!
//! ## Architecture
//!
//! - **Stub**: sender loop (assigns ids, writes invocations) and receiver
//!   loop (routes responses through the pending-call table)
//! - **Skel**: dispatcher loop (reads invocations, one execution task per
//!   call) and replier loop (the only writer of responses)
//! - **Wire**: self-delimiting frames, 18-byte header + MsgPack payload
//!
//! Each endpoint stops both of its loops when either one sees end of
//! stream or `close()` is called; waiting callers are answered with
//! [`RiiError::ConnectionClosed`] instead of hanging.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use riiwire::{Skel, Stub};
//!
//! struct Calculator;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), riiwire::RiiError> {
//!     let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//!
//!     let skel = Skel::new(Calculator)
//!         .function(|_calc: Arc<Calculator>, (a, b): (i64, i64)| async move { Ok(a + b) });
//!     let server = skel.start_stream(server_io);
//!
//!     let stub = Stub::builder().start_stream(client_io);
//!     let sum: i64 = stub.invoke(0, &(2, 7)).await?;
//!     assert_eq!(sum, 9);
//!
//!     stub.close().await;
//!     server.closed().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod handler;
pub mod pending;
pub mod protocol;
pub mod transport;
pub mod writer;

mod endpoint;
mod skel;
mod stub;

pub use error::{Result, RiiError};
pub use handler::{AppError, CallResult};
pub use protocol::{Fault, FaultKind};
pub use skel::{Skel, SkelConfig, SkelHandle, DEFAULT_MAX_CONCURRENT_CALLS};
pub use stub::{Stub, StubBuilder, StubConfig, DEFAULT_CHANNEL_CAPACITY};
