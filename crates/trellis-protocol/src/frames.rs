//! Frame types for the Trellis protocol.
//!
//! Every frame is a MessagePack map tagged with its `type`. Requests sent by a
//! client carry a 16-bit `id` that the server echoes in the matching `ack`,
//! `response` or `error`.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Subscribe = 0x03,
    Unsubscribe = 0x04,
    Publish = 0x05,
    Request = 0x06,
    Message = 0x07,
    Response = 0x08,
    Ack = 0x09,
    Error = 0x0A,
    Ping = 0x0B,
    Pong = 0x0C,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Subscribe),
            0x04 => Ok(FrameType::Unsubscribe),
            0x05 => Ok(FrameType::Publish),
            0x06 => Ok(FrameType::Request),
            0x07 => Ok(FrameType::Message),
            0x08 => Ok(FrameType::Response),
            0x09 => Ok(FrameType::Ack),
            0x0A => Ok(FrameType::Error),
            0x0B => Ok(FrameType::Ping),
            0x0C => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Major protocol version spoken by the client.
        version: u8,
        /// Username reported in presence.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Connection identifier, also the presence `id`.
        connection_id: String,
        /// Heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Subscribe to a channel.
    #[serde(rename = "subscribe")]
    Subscribe {
        id: u16,
        key: String,
        channel: String,
        /// Respond with the presence roster.
        #[serde(default)]
        status: bool,
        /// Replay up to this many retained messages.
        #[serde(default)]
        last: u32,
    },

    /// Unsubscribe from a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        id: u16,
        key: String,
        channel: String,
    },

    /// Publish a message.
    #[serde(rename = "publish")]
    Publish {
        /// Request ID, only set when the client wants an ack.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u16>,
        key: String,
        channel: String,
        /// Retain the message for this many seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl: Option<u32>,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Typed request routed to a server-side handler.
    #[serde(rename = "request")]
    Request {
        id: u16,
        /// Handler type tag.
        kind: u32,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Message delivered to a subscriber.
    #[serde(rename = "message")]
    Message {
        channel: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Handler response.
    #[serde(rename = "response")]
    Response {
        id: u16,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Request succeeded.
    #[serde(rename = "ack")]
    Ack { id: u16 },

    /// Request failed.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request, 0 if not applicable.
        id: u16,
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping,

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong,
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::Request { .. } => FrameType::Request,
            Frame::Message { .. } => FrameType::Message,
            Frame::Response { .. } => FrameType::Response,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping => FrameType::Ping,
            Frame::Pong => FrameType::Pong,
        }
    }

    /// Request ID carried by the frame, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u16> {
        match self {
            Frame::Subscribe { id, .. }
            | Frame::Unsubscribe { id, .. }
            | Frame::Request { id, .. }
            | Frame::Response { id, .. }
            | Frame::Ack { id }
            | Frame::Error { id, .. } => Some(*id),
            Frame::Publish { id, .. } => *id,
            _ => None,
        }
    }

    /// Create a Connect frame.
    #[must_use]
    pub fn connect(version: u8, username: Option<String>) -> Self {
        Frame::Connect { version, username }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            heartbeat,
        }
    }

    /// Create a plain Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u16, key: impl Into<String>, channel: impl Into<String>) -> Self {
        Frame::Subscribe {
            id,
            key: key.into(),
            channel: channel.into(),
            status: false,
            last: 0,
        }
    }

    /// Create an Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u16, key: impl Into<String>, channel: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            id,
            key: key.into(),
            channel: channel.into(),
        }
    }

    /// Create a fire-and-forget Publish frame.
    #[must_use]
    pub fn publish(
        key: impl Into<String>,
        channel: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Frame::Publish {
            id: None,
            key: key.into(),
            channel: channel.into(),
            ttl: None,
            payload: payload.into(),
        }
    }

    /// Create a Request frame.
    #[must_use]
    pub fn request(id: u16, kind: u32, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Request {
            id,
            kind,
            payload: payload.into(),
        }
    }

    /// Create a Message frame.
    #[must_use]
    pub fn message(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Message {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Create a Response frame.
    #[must_use]
    pub fn response(id: u16, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Response {
            id,
            payload: payload.into(),
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u16) -> Self {
        Frame::Ack { id }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u16, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }
}
