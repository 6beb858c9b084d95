//! 请求拦截器
//!
//! 分发路径上的钩子：`before` 在路由到 Handler 之前执行，返回错误即拒绝请求；
//! `after` 在响应写回连接之后执行，只对 `before` 已放行的拦截器调用（逆序）。

use async_trait::async_trait;
use serde_json::Value;
use tonic::Status;
use tracing::{debug, warn};

use super::frame::Request;

/// 拦截器 trait
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn before(&self, _request: &Request) -> Result<(), Status> {
        Ok(())
    }

    async fn after(&self, _request: &Request, _outcome: &Result<Value, Status>) {}
}

/// 日志拦截器
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn before(&self, request: &Request) -> Result<(), Status> {
        debug!(
            request_id = request.id,
            service = %request.service,
            endpoint = %request.endpoint,
            "Request received"
        );
        Ok(())
    }

    async fn after(&self, request: &Request, outcome: &Result<Value, Status>) {
        match outcome {
            Ok(_) => debug!(
                request_id = request.id,
                endpoint = %request.endpoint,
                "Request completed"
            ),
            Err(status) => warn!(
                request_id = request.id,
                endpoint = %request.endpoint,
                code = ?status.code(),
                message = %status.message(),
                "Request failed"
            ),
        }
    }
}
