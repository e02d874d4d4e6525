//! Call and result model shared by every wire protocol.
//!
//! A [`Request`] is the logical call: which service and method to run, the
//! already-serialized parameters and a small string map of attachments. A
//! [`Response`] carries the matching correlation id (`log_id`) back together
//! with a [`Status`] and either the serialized return value or an error text.
//!
//! Codecs translate these structures to and from bytes; nothing in this module
//! knows about framing.
//!
//! # Key Components
//!
//! - [`Message`]: Everything a codec can put on, or take off, the wire.
//! - [`MethodDescriptor`]: Explicit description of a remote method, consumed by
//!   the client's generic invoke entry point.
use std::{collections::BTreeMap, fmt, time::Duration};

use crate::protocol::ProtocolId;

/// Free-form key/value metadata travelling next to the payload.
pub type Attachments = BTreeMap<String, String>;

/// Outcome of a call as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Ok,
    ServiceNotFound,
    MethodNotFound,
    BadRequest,
    ApplicationError,
    ServerError,
    RateLimited,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        match value {
            Status::Ok => 0,
            Status::ServiceNotFound => 1,
            Status::MethodNotFound => 2,
            Status::BadRequest => 3,
            Status::ApplicationError => 4,
            Status::ServerError => 5,
            Status::RateLimited => 6,
        }
    }
}

impl TryFrom<u16> for Status {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::ServiceNotFound),
            2 => Ok(Status::MethodNotFound),
            3 => Ok(Status::BadRequest),
            4 => Ok(Status::ApplicationError),
            5 => Ok(Status::ServerError),
            6 => Ok(Status::RateLimited),
            other => Err(other),
        }
    }
}

/// A single outgoing call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Correlation id; assigned by the future store right before encoding.
    pub log_id: u64,
    pub service: String,
    pub method: String,
    /// Serialized parameters.
    pub payload: Vec<u8>,
    pub attachments: Attachments,
    /// Wire protocol the request was (or will be) encoded with.
    pub protocol: ProtocolId,
    /// Remaining time budget the caller granted the server.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(service: impl Into<String>, method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Copy of the call without its parameters; what completion hooks keep around.
    pub fn header(&self) -> Request {
        Request {
            log_id: self.log_id,
            service: self.service.clone(),
            method: self.method.clone(),
            payload: Vec::new(),
            attachments: self.attachments.clone(),
            protocol: self.protocol,
            timeout: self.timeout,
        }
    }
}

/// The server's answer to exactly one [`Request`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub log_id: u64,
    pub status: Status,
    /// Serialized return value; empty for failed calls.
    pub payload: Vec<u8>,
    /// Human readable error detail when `status` is not [`Status::Ok`].
    pub error: Option<String>,
    pub attachments: Attachments,
    pub protocol: ProtocolId,
}

impl Response {
    pub fn ok(log_id: u64, payload: Vec<u8>) -> Self {
        Self {
            log_id,
            payload,
            ..Default::default()
        }
    }

    pub fn error(log_id: u64, status: Status, message: impl Into<String>) -> Self {
        Self {
            log_id,
            status,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// A one-way, server initiated notification. Never correlated with a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Push {
    pub service: String,
    pub method: String,
    pub payload: Vec<u8>,
    pub attachments: Attachments,
}

impl Push {
    pub fn new(service: impl Into<String>, method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            payload,
            attachments: Attachments::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Push(Push),
}

impl Message {
    /// Correlation id of the frame; pushes always report `0`.
    pub fn log_id(&self) -> u64 {
        match self {
            Message::Request(req) => req.log_id,
            Message::Response(resp) => resp.log_id,
            Message::Push(_) => 0,
        }
    }
}

/// Explicit description of a remote method.
///
/// Stands in for a generated stub: typed wrappers build one of these and hand
/// it to [`RpcClient::invoke`](crate::client::RpcClient::invoke).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub service: String,
    pub method: String,
    pub request_type: &'static str,
    pub response_type: &'static str,
}

impl MethodDescriptor {
    /// Untyped method; parameters and results are raw bytes.
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            request_type: "bytes",
            response_type: "bytes",
        }
    }

    pub fn typed<Req, Resp>(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            request_type: std::any::type_name::<Req>(),
            response_type: std::any::type_name::<Resp>(),
        }
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}
