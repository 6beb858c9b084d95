//! Flare Micro 错误处理模块
//!
//! 按照注册生命周期划分错误类别：
//! - 致命错误（`Config` / `Registration` / `Startup` / `Server` / `Shutdown`）会让 `run()` 进入注销流程后返回；
//! - 非致命错误（`Renewal` / `Deregistration`）只记录日志，由 TTL 兜底，不会出现在 `run()` 的返回值中。
//!
//! 远程调用失败统一使用 [`tonic::Status`] 表达，转换逻辑见 [`status`] 子模块。

pub mod status;

use std::time::Duration;
use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Registration,
    Startup,
    Server,
    Renewal,
    Deregistration,
    Shutdown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::Registration => "REGISTRATION_ERROR",
            ErrorKind::Startup => "STARTUP_ERROR",
            ErrorKind::Server => "SERVER_ERROR",
            ErrorKind::Renewal => "RENEWAL_ERROR",
            ErrorKind::Deregistration => "DEREGISTRATION_ERROR",
            ErrorKind::Shutdown => "SHUTDOWN_ERROR",
        }
    }

    /// 是否为致命错误（会终止 `run()`）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::Renewal | ErrorKind::Deregistration)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 运行时错误
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// 配置非法（例如服务名为空、续期间隔不小于 TTL），在任何网络活动之前失败
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 首次注册在取消前未能成功
    #[error("registration of `{service}` failed after {attempts} attempt(s): {reason}")]
    Registration {
        service: String,
        attempts: usize,
        reason: String,
    },

    /// 启动钩子失败
    #[error("startup failed: {0}")]
    Startup(String),

    /// 传输层服务失败
    #[error("server error: {0}")]
    Server(String),

    /// 续期失败（非致命）
    #[error("renewal failed: {0}")]
    Renewal(String),

    /// 注销失败（非致命）
    #[error("deregistration failed: {0}")]
    Deregistration(String),

    /// 停止钩子失败
    #[error("shutdown hook failed: {0}")]
    Shutdown(String),
}

impl RuntimeError {
    pub fn config(msg: impl Into<String>) -> Self {
        RuntimeError::Config(msg.into())
    }

    pub fn server(err: impl std::fmt::Display) -> Self {
        RuntimeError::Server(err.to_string())
    }

    /// 获取错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Config(_) => ErrorKind::Config,
            RuntimeError::Registration { .. } => ErrorKind::Registration,
            RuntimeError::Startup(_) => ErrorKind::Startup,
            RuntimeError::Server(_) => ErrorKind::Server,
            RuntimeError::Renewal(_) => ErrorKind::Renewal,
            RuntimeError::Deregistration(_) => ErrorKind::Deregistration,
            RuntimeError::Shutdown(_) => ErrorKind::Shutdown,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}

/// 注册中心错误
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("service `{0}` not found")]
    NotFound(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("registry backend error: {0}")]
    Backend(String),

    #[error("registry codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Codec(err.to_string())
    }
}

/// 传输层错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("server is not listening")]
    NotListening,

    #[error("server is already serving")]
    AlreadyServing,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RuntimeError>;
