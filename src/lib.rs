//! Flare Micro
//!
//! 把通用微服务运行时绑定到具体传输层，并管理服务在注册中心中的完整生命周期：
//! 带 TTL 的注册、周期续期、以及任何退出路径上恰好一次的注销。
//! 支持两种模式：常驻的 Service 与只服务一次调用的 Function。

pub mod config;
pub mod error;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod telemetry;
pub mod transport;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{ErrorKind, RegistryError, Result, RuntimeError, TransportError};
pub use registry::{MemoryRegistry, Registry, SelectStrategy, Selector};
pub use runtime::options::{DEFAULT_ADDRESS, DEFAULT_SERVICE_NAME};
pub use runtime::{
    LeaseState, Mode, OptionSet, Runtime, RuntimeBuilder, RuntimeOption, new_function, new_service,
    options,
};
pub use telemetry::{LogFormat, TelemetryConfig, init_tracing};
pub use transport::{
    CallOptions, Client, Handler, Interceptor, PeerVerification, SecurityContext, Server,
    ServiceHandler, TcpTransport, TransportBinding,
};
pub use types::{Endpoint, Node, ServiceDescriptor};

#[cfg(feature = "etcd")]
pub use registry::EtcdRegistry;
