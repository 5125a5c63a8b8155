//! Invocation and response records.
//!
//! These are the only two messages that travel on the wire. Each maps to
//! exactly one frame:
//!
//! - [`Invocation`]: kind `INVOCATION`, payload = MsgPack argument list
//! - [`Response`]: kind `RESPONSE`, payload = MsgPack result list, or a
//!   MsgPack [`Fault`] when `IS_ERROR` is set
//!
//! Arguments and results stay opaque (`Bytes`) at this level; the stub and
//! the function table decode them into concrete types.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::wire_format::{flags, kind, Header, ABSOLUTE_MAX_PAYLOAD_SIZE};
use super::Frame;
use crate::codec::MsgPackCodec;
use crate::error::{Result, RiiError};
use crate::writer::OutboundFrame;

/// Category of a fault carried back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The function itself returned an error.
    Application,
    /// The function number is outside the registered range.
    NoSuchFunction,
    /// The argument list did not match the function's parameters.
    BadArguments,
    /// The invocation frame could not be interpreted.
    Malformed,
    /// The function panicked.
    Panicked,
    /// The results could not be encoded or written.
    Encode,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::Application => "application error",
            FaultKind::NoSuchFunction => "no such function",
            FaultKind::BadArguments => "bad arguments",
            FaultKind::Malformed => "malformed invocation",
            FaultKind::Panicked => "function panicked",
            FaultKind::Encode => "encode failure",
        };
        f.write_str(name)
    }
}

/// Error payload of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    /// Create a new fault.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

/// A call to a numbered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Correlation id assigned by the stub's sender loop.
    pub id: u64,
    /// Index into the skel's function table.
    pub function: u32,
    /// MsgPack-encoded argument list.
    pub args: Bytes,
}

impl Invocation {
    /// Create a new invocation.
    pub fn new(id: u64, function: u32, args: Bytes) -> Self {
        Self { id, function, args }
    }

    /// Encode into an outbound frame.
    pub fn to_frame(&self) -> Result<OutboundFrame> {
        let len = payload_len(&self.args)?;
        let header = Header::new(kind::INVOCATION, 0, self.function, self.id, len);
        Ok(OutboundFrame::new(&header, self.args.clone()))
    }

    /// Interpret a received frame as an invocation.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let header = frame.header;
        header.validate(ABSOLUTE_MAX_PAYLOAD_SIZE)?;

        if !header.is_invocation() {
            return Err(header.malformed(format!(
                "expected an invocation, got kind 0x{:02x}",
                header.kind
            )));
        }

        Ok(Self {
            id: header.call_id,
            function: header.function,
            args: frame.payload,
        })
    }
}

/// The outcome of an invocation, echoing its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Id of the inciting invocation.
    pub id: u64,
    /// Function number of the inciting invocation.
    pub function: u32,
    /// MsgPack-encoded result list, or the fault that replaced it.
    pub outcome: std::result::Result<Bytes, Fault>,
}

impl Response {
    /// A successful response.
    pub fn success(id: u64, function: u32, results: Bytes) -> Self {
        Self {
            id,
            function,
            outcome: Ok(results),
        }
    }

    /// A fault response.
    pub fn fault(id: u64, function: u32, kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            id,
            function,
            outcome: Err(Fault::new(kind, message)),
        }
    }

    /// Check if this response carries a fault.
    #[inline]
    pub fn is_fault(&self) -> bool {
        self.outcome.is_err()
    }

    /// Encode into an outbound frame.
    pub fn to_frame(&self) -> Result<OutboundFrame> {
        let (flag_bits, payload) = match &self.outcome {
            Ok(results) => (0, results.clone()),
            Err(fault) => (flags::IS_ERROR, Bytes::from(MsgPackCodec::encode(fault)?)),
        };
        let len = payload_len(&payload)?;
        let header = Header::new(kind::RESPONSE, flag_bits, self.function, self.id, len);
        Ok(OutboundFrame::new(&header, payload))
    }

    /// Interpret a received frame as a response.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let header = frame.header;
        header.validate(ABSOLUTE_MAX_PAYLOAD_SIZE)?;

        if !header.is_response() {
            return Err(header.malformed(format!(
                "expected a response, got kind 0x{:02x}",
                header.kind
            )));
        }

        let outcome = if header.is_error() {
            let fault: Fault = MsgPackCodec::decode(&frame.payload)
                .map_err(|e| header.malformed(format!("undecodable fault payload: {e}")))?;
            Err(fault)
        } else {
            Ok(frame.payload)
        };

        Ok(Self {
            id: header.call_id,
            function: header.function,
            outcome,
        })
    }

    /// Turn the outcome into what the waiting caller sees.
    pub fn into_result(self) -> Result<Bytes> {
        self.outcome.map_err(RiiError::Remote)
    }
}

fn payload_len(payload: &Bytes) -> Result<u32> {
    u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= ABSOLUTE_MAX_PAYLOAD_SIZE)
        .ok_or_else(|| {
            RiiError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                payload.len(),
                ABSOLUTE_MAX_PAYLOAD_SIZE
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, HEADER_SIZE};

    fn reparse(frame: OutboundFrame) -> Frame {
        let mut bytes = frame.header.to_vec();
        bytes.extend_from_slice(&frame.payload);
        let mut buffer = FrameBuffer::new();
        let mut frames = buffer.push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    #[test]
    fn test_invocation_frame_layout() {
        let args = Bytes::from(MsgPackCodec::encode(&(2, 7)).unwrap());
        let invocation = Invocation::new(11, 0, args.clone());
        let frame = invocation.to_frame().unwrap();

        assert_eq!(frame.size(), HEADER_SIZE + args.len());
        let header = Header::decode(&frame.header).unwrap();
        assert!(header.is_invocation());
        assert_eq!(header.call_id, 11);
        assert_eq!(header.function, 0);

        let decoded = Invocation::from_frame(reparse(frame)).unwrap();
        assert_eq!(decoded, invocation);
    }

    #[test]
    fn test_fault_response_sets_error_flag() {
        let response = Response::fault(5, 9, FaultKind::NoSuchFunction, "no function 9");
        let frame = response.to_frame().unwrap();
        let header = Header::decode(&frame.header).unwrap();
        assert!(header.is_error());

        let decoded = Response::from_frame(reparse(frame)).unwrap();
        assert_eq!(decoded, response);
        match decoded.into_result() {
            Err(RiiError::Remote(fault)) => assert_eq!(fault.kind, FaultKind::NoSuchFunction),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_response_rejects_invocation_frame() {
        let invocation = Invocation::new(3, 1, Bytes::new());
        let err = Response::from_frame(reparse(invocation.to_frame().unwrap())).unwrap_err();
        match err {
            RiiError::Malformed { id, reason } => {
                assert_eq!(id, Some(3));
                assert!(reason.contains("expected a response"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_undecodable_fault_is_malformed() {
        let header = Header::new(kind::RESPONSE, flags::IS_ERROR, 0, 4, 3);
        let frame = Frame::new(header, Bytes::from_static(&[0xc1, 0xc1, 0xc1]));
        let err = Response::from_frame(frame).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_fault_display() {
        let fault = Fault::new(FaultKind::Application, "divide by zero");
        assert_eq!(fault.to_string(), "application error: divide by zero");
    }
}
