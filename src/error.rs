//! Crate-level error taxonomy.
//!
//! Every module owns a narrow `thiserror` enum; [`RpcError`] composes them into
//! the single error type callers see. Only [`RpcError::Connection`] is retried by
//! the client, everything else surfaces on first occurrence.
use std::{io, time::Duration};

use thiserror::Error;

use crate::{
    codec::{CodecError, CodecErrorKind},
    config::ConfigError,
    message::Status,
    naming::NamingError,
    pool::PoolError,
    protocol::FrameError,
    store::StoreError,
};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] CodecError),
    #[error("corrupt frame: {0}")]
    Corrupt(#[from] FrameError),
    #[error("no provider available for service `{service}`")]
    NoProvider { service: String },
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("call rejected by interceptor `{interceptor}`")]
    RateLimited { interceptor: String },
    #[error("call {log_id} timed out after {elapsed:?}")]
    Timeout { log_id: u64, elapsed: Duration },
    #[error("call {log_id} was cancelled")]
    Cancelled { log_id: u64 },
    #[error("remote error ({status:?}): {message}")]
    Remote { status: Status, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Naming(#[from] NamingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RpcError {
    pub fn connection(endpoint: impl ToString, reason: impl ToString) -> Self {
        RpcError::Connection {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    /// An outgoing frame could not be built. Nothing was written, so this is a
    /// serialization failure and the connection stays usable.
    pub fn encoding(err: FrameError) -> Self {
        let codec = match &err {
            FrameError::BadMagic { protocol }
            | FrameError::TooLarge { protocol, .. }
            | FrameError::Malformed { protocol, .. }
            | FrameError::Unsupported { protocol, .. } => *protocol,
            FrameError::UnknownProtocol(_) | FrameError::Unrecognized => "frame",
        };
        RpcError::Serialization(CodecError::serialize(codec, err))
    }

    /// Whether the client may retry the call against another endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Connection { .. })
    }

    /// Wire status reported when this error ends a server-side call.
    pub fn status(&self) -> Status {
        match self {
            RpcError::RateLimited { .. } => Status::RateLimited,
            RpcError::Remote { status, .. } => *status,
            RpcError::Serialization(e) if e.kind == CodecErrorKind::Serialize => {
                Status::ServerError
            }
            RpcError::Serialization(_) | RpcError::Corrupt(_) => Status::BadRequest,
            _ => Status::ServerError,
        }
    }
}

impl From<PoolError> for RpcError {
    fn from(value: PoolError) -> Self {
        match &value {
            PoolError::Exhausted { endpoint, .. }
            | PoolError::Connect { endpoint, .. }
            | PoolError::Closed { endpoint } => RpcError::Connection {
                endpoint: endpoint.clone(),
                reason: value.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_errors_retry() {
        assert!(RpcError::connection("127.0.0.1:1", "refused").is_retryable());
        assert!(
            !RpcError::Timeout {
                log_id: 1,
                elapsed: Duration::from_millis(5)
            }
            .is_retryable()
        );
        assert!(
            !RpcError::NoProvider {
                service: "echo".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn pool_errors_become_connection_errors() {
        let err: RpcError = PoolError::Closed {
            endpoint: "10.0.0.1:80".into(),
        }
        .into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("10.0.0.1:80"));
    }

    #[test]
    fn status_mapping() {
        let limited = RpcError::RateLimited {
            interceptor: "rate_limit".into(),
        };
        assert_eq!(limited.status(), Status::RateLimited);

        let remote = RpcError::Remote {
            status: Status::MethodNotFound,
            message: "nope".into(),
        };
        assert_eq!(remote.status(), Status::MethodNotFound);

        let corrupt: RpcError = FrameError::BadMagic { protocol: "relay_std" }.into();
        assert_eq!(corrupt.status(), Status::BadRequest);
    }

    #[test]
    fn encode_failures_are_serialization_errors() {
        let err = RpcError::encoding(FrameError::Unsupported {
            protocol: "dubbo",
            what: "a payload that is not a JSON document".into(),
        });
        match &err {
            RpcError::Serialization(e) => {
                assert_eq!(e.codec, "dubbo");
                assert_eq!(e.kind, CodecErrorKind::Serialize);
            }
            other => panic!("unexpected {other}"),
        }
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Status::ServerError);
    }
}
