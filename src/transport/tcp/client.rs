//! TCP 客户端

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tonic::Status;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::registry::{Registry, SelectStrategy, Selector};
use crate::retry::{FixedRetryPolicy, RetryPolicy};
use crate::transport::frame::{self, Request, Response};
use crate::transport::security::SecurityContext;
use crate::transport::{CallOptions, Client, IoStream};

/// 重试前的等待
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// 一次尝试的失败
///
/// `delivered` 为真表示请求帧已经完整写出，对端可能已经执行，不能再重试。
#[derive(Debug)]
struct AttemptError {
    status: Status,
    delivered: bool,
}

impl AttemptError {
    fn undelivered(status: impl Into<Status>) -> Self {
        Self {
            status: status.into(),
            delivered: false,
        }
    }

    fn delivered(status: impl Into<Status>) -> Self {
        Self {
            status: status.into(),
            delivered: true,
        }
    }
}

/// TCP 客户端
///
/// 每次调用：解析服务 → 选择节点 → 建立连接（可选 TLS）→ 一次请求/响应。
/// 只有请求尚未送达（解析、连接、握手、写出失败）时才会重试。
pub struct TcpClient {
    registry: Arc<dyn Registry>,
    security: Option<Arc<SecurityContext>>,
    selector: Selector,
    next_id: AtomicU64,
}

impl TcpClient {
    pub fn new(registry: Arc<dyn Registry>, security: Option<Arc<SecurityContext>>) -> Self {
        Self {
            registry,
            security,
            selector: Selector::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_strategy(mut self, strategy: SelectStrategy) -> Self {
        self.selector = Selector::new(strategy);
        self
    }

    async fn attempt(
        &self,
        options: &CallOptions,
        service: &str,
        endpoint: &str,
        body: Value,
    ) -> Result<Value, AttemptError> {
        let nodes = self
            .registry
            .resolve(service)
            .await
            .map_err(AttemptError::undelivered)?;
        let node = self.selector.select(&nodes).ok_or_else(|| {
            AttemptError::undelivered(Status::unavailable(format!("no nodes available for {}", service)))
        })?;

        let request = Request {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            headers: options.headers.clone(),
            body,
        };
        debug!(
            service = %service,
            endpoint = %endpoint,
            node_id = %node.id,
            address = %node.address,
            "Calling remote endpoint"
        );

        let exchange = tokio::time::timeout(options.timeout, self.exchange(node.address, request));
        let outcome = match &options.cancellation {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(AttemptError::delivered(Status::cancelled("call cancelled"))),
                outcome = exchange => outcome,
            },
            None => exchange.await,
        };

        outcome.unwrap_or_else(|_| {
            Err(AttemptError::delivered(Status::deadline_exceeded(format!(
                "call to {} timed out after {:?}",
                endpoint, options.timeout
            ))))
        })
    }

    async fn connect(&self, address: SocketAddr) -> Result<Box<dyn IoStream>, TransportError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;

        match &self.security {
            Some(security) => {
                let server_name = security
                    .server_name_for(&address.ip().to_string())
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                let tls = security
                    .connector()
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }

    async fn exchange(&self, address: SocketAddr, request: Request) -> Result<Value, AttemptError> {
        let io = self.connect(address).await.map_err(AttemptError::undelivered)?;
        let mut framed = frame::framed(io);

        let payload = frame::encode(&request).map_err(AttemptError::undelivered)?;
        // 写出失败时对端收到的是不完整的帧，不会被执行
        framed
            .send(payload)
            .await
            .map_err(|e| AttemptError::undelivered(TransportError::from(e)))?;

        let bytes = match framed.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return Err(AttemptError::delivered(TransportError::from(e))),
            None => {
                return Err(AttemptError::delivered(Status::unavailable(
                    "connection closed before response",
                )));
            }
        };

        let response: Response = frame::decode(&bytes).map_err(AttemptError::delivered)?;
        if response.id != request.id && response.code == tonic::Code::Ok as i32 {
            return Err(AttemptError::delivered(Status::internal(format!(
                "response id {} does not match request id {}",
                response.id, request.id
            ))));
        }
        response.into_result().map_err(AttemptError::delivered)
    }
}

#[async_trait]
impl Client for TcpClient {
    async fn call(
        &self,
        options: &CallOptions,
        service: &str,
        endpoint: &str,
        request: Value,
    ) -> Result<Value, Status> {
        let policy = FixedRetryPolicy::new(options.retries + 1, RETRY_DELAY);
        let mut attempt = 0;

        loop {
            match self.attempt(options, service, endpoint, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(failure) if !failure.delivered && policy.should_retry(attempt, &failure.status) => {
                    warn!(
                        service = %service,
                        endpoint = %endpoint,
                        attempt = attempt + 1,
                        error = %failure.status.message(),
                        "Call failed before delivery, retrying"
                    );
                    tokio::time::sleep(policy.backoff_duration(attempt)).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure.status),
            }
        }
    }
}
