//! 传输层模块
//!
//! 运行时只依赖 [`Client`] / [`Server`] 两个能力接口，具体线协议由 [`TransportBinding`]
//! 提供。当前内置的绑定是 [`tcp::TcpTransport`]（长度前缀帧 + JSON 信封，可选 TLS）。

pub mod frame;
pub mod handler;
pub mod interceptor;
pub mod security;
pub mod tcp;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::error::TransportError;
use crate::registry::Registry;
use crate::types::Endpoint;

pub use handler::{Handler, ServiceHandler};
pub use interceptor::{Interceptor, LoggingInterceptor};
pub use security::{PeerVerification, SecurityContext, SecurityContextBuilder, SecurityError};
pub use tcp::{TcpClient, TcpServer, TcpTransport};

/// 默认调用超时
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// 默认重试次数
pub const DEFAULT_CALL_RETRIES: usize = 1;

/// 明文与 TLS 连接的统一抽象
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// 单次调用选项
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// 单次尝试的超时
    pub timeout: Duration,
    /// 失败后的重试次数（仅对 `Unavailable` 生效）
    pub retries: usize,
    /// 调用方取消
    pub cancellation: Option<CancellationToken>,
    /// 透传的请求头
    pub headers: HashMap<String, String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            retries: DEFAULT_CALL_RETRIES,
            cancellation: None,
            headers: HashMap::new(),
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// 客户端能力
#[async_trait]
pub trait Client: Send + Sync {
    /// 调用远端服务的端点；`service` 通过注册中心解析
    async fn call(
        &self,
        options: &CallOptions,
        service: &str,
        endpoint: &str,
        request: Value,
    ) -> Result<Value, Status>;
}

impl dyn Client {
    /// 带类型的调用
    pub async fn invoke<Req, Resp>(
        &self,
        options: &CallOptions,
        service: &str,
        endpoint: &str,
        request: &Req,
    ) -> Result<Resp, Status>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_value(request)
            .map_err(|e| Status::invalid_argument(format!("failed to encode request: {}", e)))?;
        let response = self.call(options, service, endpoint, body).await?;
        serde_json::from_value(response)
            .map_err(|e| Status::internal(format!("failed to decode response: {}", e)))
    }
}

/// 服务端能力
#[async_trait]
pub trait Server: Send + Sync {
    /// 挂载处理器（同名处理器会被替换）
    async fn handle(&self, handler: Arc<dyn Handler>) -> Result<(), TransportError>;

    /// 追加拦截器
    async fn intercept(&self, interceptor: Arc<dyn Interceptor>);

    /// 已挂载处理器的全部端点
    async fn endpoints(&self) -> Vec<Endpoint>;

    /// 绑定监听地址（不接受连接），返回实际地址
    async fn listen(&self) -> Result<SocketAddr, TransportError>;

    /// 开始接受连接
    async fn start(&self) -> Result<(), TransportError>;

    /// 停止接受连接，等待在途请求完成
    async fn stop(&self) -> Result<(), TransportError>;

    /// 服务循环结束时返回；致命的接受错误返回 `Err`
    async fn closed(&self) -> Result<(), TransportError>;
}

/// Client / Server 对
#[derive(Clone)]
pub struct TransportPair {
    pub client: Arc<dyn Client>,
    pub server: Arc<dyn Server>,
}

/// 创建传输时由运行时提供的参数
#[derive(Clone)]
pub struct TransportSettings {
    /// 服务端监听地址（端口可为 0）
    pub address: SocketAddr,
    /// 客户端解析服务所用的注册中心
    pub registry: Arc<dyn Registry>,
    /// 安全上下文；`None` 表示明文
    pub security: Option<Arc<SecurityContext>>,
    /// 停止时等待在途请求的上限
    pub shutdown_timeout: Duration,
}

/// 传输绑定：为一种线协议生产 Client 与 Server
///
/// 给定安全上下文时，两端使用同一份上下文；未给定时以明文运行。
pub trait TransportBinding: Send + Sync {
    /// 线协议名称
    fn name(&self) -> &str;

    fn create_transport(&self, settings: TransportSettings) -> TransportPair;
}
