//! Error type returned by exported functions.

use std::fmt;

/// An error raised inside an exported function.
///
/// Only the message crosses the wire; the caller sees it as a
/// [`FaultKind::Application`](crate::protocol::FaultKind::Application) fault.
/// Any `std::error::Error` converts into it, so `?` works inside functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppError {
    message: String,
}

impl AppError {
    /// Create an error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message sent to the caller.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn into_message(self) -> String {
        self.message
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for AppError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}
