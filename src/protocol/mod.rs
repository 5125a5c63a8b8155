//! Protocol module - wire format, framing, and the two message records.
//!
//! This module implements the self-delimiting message codec:
//! - 18-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Async frame reader
//! - `Invocation` / `Response` records and their frame mapping

mod frame;
mod frame_buffer;
mod message;
mod reader;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{Fault, FaultKind, Invocation, Response};
pub use reader::FrameReader;
pub use wire_format::{
    flags, kind, Header, MessageKind, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE,
    HEADER_SIZE, RESERVED_CALL_ID,
};
