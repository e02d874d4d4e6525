//! Wire protocols.
//!
//! This module defines how [`Message`]s become bytes on a connection and how a
//! stream of bytes, delivered in arbitrarily small pieces by TCP, is cut back
//! into messages.
//!
//! # Overview
//!
//! Every wire format implements [`Protocol`]. Encoding is a pure function from a
//! message to a contiguous buffer. Decoding inspects the front of an
//! accumulation buffer and answers with a [`Decoded`] value:
//!
//! - [`Decoded::Frame`]: a whole frame was present; the caller drops `consumed`
//!   bytes from the front of its buffer.
//! - [`Decoded::Skipped`]: a whole frame was present but carries nothing for the
//!   caller (heartbeats and similar control frames).
//! - [`Decoded::Insufficient`]: not enough bytes yet. This is a plain variant,
//!   not an error, and costs nothing to produce.
//!
//! Anything that can never become a valid frame (wrong magic, absurd length,
//! undecodable body) is a [`FrameError`] and the connection carrying it is
//! closed.
//!
//! # Key Components
//!
//! - [`ProtocolRegistry`]: id → codec lookup and first-bytes protocol detection.
//! - [`StandardProtocol`]: the native framing, bincode metadata plus raw payload.
//! - [`NsheadProtocol`]: legacy 36-byte header with JSON or protobuf bodies.
//! - [`PushProtocol`]: framing that also carries server-initiated pushes.
//! - [`DubboProtocol`]: a dubbo-compatible header with JSON bodies.
//!
//! # Binary Format
//!
//! All built-in formats share the same shape: a fixed-size header that begins
//! with a magic number and contains the body length, followed by the body.
//! Body lengths above [`MAX_BODY_LEN`] are rejected before any allocation.
//!
//! # See Also
//!
//! - [`transport`](crate::transport): incremental reader feeding bytes to a codec.
use std::fmt;

use thiserror::Error;

use crate::message::{Message, Push, Request, Response};

mod dubbo;
mod nshead;
mod push;
mod registry;
mod standard;

pub use dubbo::DubboProtocol;
pub use nshead::NsheadProtocol;
pub use push::PushProtocol;
pub use registry::{ProtocolDescriptor, ProtocolFactory, ProtocolRegistry};
pub use standard::StandardProtocol;

/// Numeric identifier of a wire protocol.
pub type ProtocolId = u32;

pub const STANDARD: ProtocolId = 1;
pub const NSHEAD_JSON: ProtocolId = 2;
pub const NSHEAD_PROTO: ProtocolId = 3;
pub const PUSH: ProtocolId = 4;
pub const DUBBO: ProtocolId = 5;

/// Largest body any built-in codec will accept.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("[{protocol}] bad magic number")]
    BadMagic { protocol: &'static str },
    #[error("[{protocol}] body of {len} bytes exceeds limit of {max}")]
    TooLarge {
        protocol: &'static str,
        len: usize,
        max: usize,
    },
    #[error("[{protocol}] malformed frame: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },
    #[error("[{protocol}] cannot carry {what}")]
    Unsupported {
        protocol: &'static str,
        what: String,
    },
    #[error("no protocol registered with id {0}")]
    UnknownProtocol(ProtocolId),
    #[error("no registered protocol recognises the stream")]
    Unrecognized,
}

impl FrameError {
    pub(crate) fn malformed(protocol: &'static str, reason: impl ToString) -> Self {
        FrameError::Malformed {
            protocol,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame { message: Message, consumed: usize },
    Skipped { consumed: usize },
    Insufficient,
}

/// Answer to "do these first bytes belong to you?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection<T = ()> {
    Match(T),
    NoMatch,
    NeedMore,
}

pub trait Protocol: Send + Sync + fmt::Debug {
    fn id(&self) -> ProtocolId;

    fn name(&self) -> &'static str;

    fn detect(&self, prefix: &[u8]) -> Detection;

    fn encode_request(&self, request: &Request) -> Result<Vec<u8>, FrameError>;

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>, FrameError>;

    fn encode_push(&self, _push: &Push) -> Result<Vec<u8>, FrameError> {
        Err(FrameError::Unsupported {
            protocol: self.name(),
            what: "server push".into(),
        })
    }

    /// Decodes at most one frame from the front of `buf`.
    fn decode(&self, buf: &[u8]) -> Result<Decoded, FrameError>;

    fn encode(&self, message: &Message) -> Result<Vec<u8>, FrameError> {
        match message {
            Message::Request(req) => self.encode_request(req),
            Message::Response(resp) => self.encode_response(resp),
            Message::Push(push) => self.encode_push(push),
        }
    }
}

/// Detection by a fixed magic prefix.
pub(crate) fn detect_magic(prefix: &[u8], magic: &[u8]) -> Detection {
    if prefix.len() < magic.len() {
        if magic.starts_with(prefix) {
            Detection::NeedMore
        } else {
            Detection::NoMatch
        }
    } else if prefix.starts_with(magic) {
        Detection::Match(())
    } else {
        Detection::NoMatch
    }
}

/// Validates the magic at the front of `buf`; `Ok(false)` means more bytes are needed.
pub(crate) fn check_magic(
    buf: &[u8],
    magic: &[u8],
    protocol: &'static str,
) -> Result<bool, FrameError> {
    match detect_magic(buf, magic) {
        Detection::Match(()) => Ok(true),
        Detection::NeedMore => Ok(false),
        Detection::NoMatch => Err(FrameError::BadMagic { protocol }),
    }
}

pub(crate) fn check_body_len(len: u32, protocol: &'static str) -> Result<usize, FrameError> {
    let len = len as usize;
    if len > MAX_BODY_LEN {
        return Err(FrameError::TooLarge {
            protocol,
            len,
            max: MAX_BODY_LEN,
        });
    }
    Ok(len)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_detection() {
        assert_eq!(detect_magic(b"", b"RLAY"), Detection::NeedMore);
        assert_eq!(detect_magic(b"RL", b"RLAY"), Detection::NeedMore);
        assert_eq!(detect_magic(b"RLAYxx", b"RLAY"), Detection::Match(()));
        assert_eq!(detect_magic(b"RX", b"RLAY"), Detection::NoMatch);
    }

    #[test]
    fn partial_bad_magic_is_fatal() {
        assert_eq!(check_magic(b"RL", b"RLAY", "relay_std"), Ok(false));
        assert_eq!(
            check_magic(b"GE", b"RLAY", "relay_std"),
            Err(FrameError::BadMagic {
                protocol: "relay_std"
            })
        );
    }

    #[test]
    fn body_limit() {
        assert_eq!(check_body_len(16, "p"), Ok(16));
        assert!(matches!(
            check_body_len(MAX_BODY_LEN as u32 + 1, "p"),
            Err(FrameError::TooLarge { .. })
        ));
    }
}
