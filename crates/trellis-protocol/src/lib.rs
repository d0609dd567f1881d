//! # trellis-protocol
//!
//! Wire protocol spoken between Trellis clients and the broker.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake
//! - `Subscribe` / `Unsubscribe` - Channel membership, authorized by key
//! - `Publish` / `Message` - Outbound and delivered messages
//! - `Request` / `Response` - Typed requests such as presence queries
//! - `Ack` / `Error` - Request outcomes
//!
//! ## Example
//!
//! ```rust
//! use trellis_protocol::{codec, Frame};
//!
//! let frame = Frame::publish("key", "news/sports", b"goal".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, frame);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, FrameCodec, ProtocolError};
pub use frames::{Frame, FrameType};
pub use version::{negotiate, Version, PROTOCOL_VERSION};
