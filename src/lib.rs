pub mod balance;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod message;
pub mod naming;
pub mod pool;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod store;
pub mod timer;
pub mod transport;

pub use client::{CallOptions, RpcClient, RpcFuture};
pub use codec::Serialization;
pub use config::{ClientConfig, PoolConfig, RuntimeConfig, ServerConfig};
pub use error::RpcError;
pub use message::{MethodDescriptor, Push, Request, Response, Status};
pub use runtime::Runtime;
pub use server::{RemoteError, RpcServer, ServerHandle, ServiceRegistry};
