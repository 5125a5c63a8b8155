//! Codec module - serialization of argument and result lists.
//!
//! Argument and result lists travel as MessagePack. A Rust tuple is the
//! natural ordered list: `(2, 7)` encodes as a two-element array. Functions
//! without arguments take `()`.
//!
//! # Example
//!
//! ```
//! use riiwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&(2, 7)).unwrap();
//! let (a, b): (i32, i32) = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(a + b, 9);
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
