//! Handler module - the skel's function table.
//!
//! Provides:
//! - [`FunctionTable`] - exported functions indexed by number
//! - [`AppError`] / [`CallResult`] - what exported functions return
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use riiwire::handler::{AppError, FunctionTable};
//!
//! struct Store;
//!
//! let mut table = FunctionTable::<Store>::new();
//!
//! // function 0
//! table.add(|_store: Arc<Store>, (key,): (String,)| async move {
//!     if key.is_empty() {
//!         return Err(AppError::new("empty key"));
//!     }
//!     Ok(key.len())
//! });
//! ```

mod app_error;
mod registry;

pub use app_error::AppError;
pub use registry::{BoxFuture, CallResult, FunctionTable, Outcome, RemoteFunction, TypedFunction};
