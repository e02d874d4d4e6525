use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    codec::Serialization,
    error::RpcError,
    message::{Request, Response, Status},
    store::CallResult,
};

/// Failure reported by a handler; travels back to the caller as its status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{status:?}: {message}")]
pub struct RemoteError {
    pub status: Status,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(Status::ApplicationError, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, message)
    }
}

impl From<RemoteError> for RpcError {
    fn from(value: RemoteError) -> Self {
        RpcError::Remote {
            status: value.status,
            message: value.message,
        }
    }
}

pub trait Handler: Send + Sync {
    fn handle(&self, request: &Request) -> Result<Vec<u8>, RemoteError>;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Result<Vec<u8>, RemoteError> + Send + Sync,
{
    fn handle(&self, request: &Request) -> Result<Vec<u8>, RemoteError> {
        self(request)
    }
}

/// Handlers by service and method name.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, HashMap<String, Arc<dyn Handler>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler`, replacing any earlier one for the same method.
    pub fn register<H>(&mut self, service: &str, method: &str, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        self.services
            .entry(service.to_string())
            .or_default()
            .insert(method.to_string(), Arc::new(handler));
        self
    }

    /// Installs a handler working on decoded values.
    ///
    /// A payload that does not decode is a `BadRequest`; a result that does not
    /// encode is a `ServerError`.
    pub fn register_typed<Req, Resp, F>(
        &mut self,
        service: &str,
        method: &str,
        serialization: Serialization,
        f: F,
    ) -> &mut Self
    where
        Req: DeserializeOwned,
        Resp: Serialize,
        F: Fn(Req) -> Result<Resp, RemoteError> + Send + Sync + 'static,
    {
        self.register(service, method, move |request: &Request| -> Result<Vec<u8>, RemoteError> {
            let args: Req = serialization
                .deserialize(&request.payload)
                .map_err(|e| RemoteError::bad_request(e.to_string()))?;
            let value = f(args)?;
            serialization
                .serialize(&value)
                .map_err(|e| RemoteError::new(Status::ServerError, e.to_string()))
        })
    }

    pub fn lookup(&self, service: &str, method: &str) -> Result<Arc<dyn Handler>, RemoteError> {
        let methods = self.services.get(service).ok_or_else(|| {
            RemoteError::new(Status::ServiceNotFound, format!("unknown service `{service}`"))
        })?;
        methods.get(method).cloned().ok_or_else(|| {
            RemoteError::new(
                Status::MethodNotFound,
                format!("unknown method `{service}.{method}`"),
            )
        })
    }

    pub fn services(&self) -> Vec<&str> {
        let mut services: Vec<_> = self.services.keys().map(String::as_str).collect();
        services.sort_unstable();
        services
    }

    pub fn invoke(&self, request: &Request) -> CallResult {
        let handler = self.lookup(&request.service, &request.method)?;
        let payload = handler.handle(request)?;
        Ok(Response::ok(request.log_id, payload))
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.services()).finish()
    }
}
