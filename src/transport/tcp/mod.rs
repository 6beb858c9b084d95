//! TCP 传输绑定
//!
//! 每个请求一条长度前缀帧，连接可选 TLS。Client 每次调用新建连接，
//! Server 每个连接一个任务，顺序处理该连接上的请求。

mod client;
mod server;

pub use client::TcpClient;
pub use server::TcpServer;

use std::sync::Arc;

use super::{TransportBinding, TransportPair, TransportSettings};
use crate::registry::SelectStrategy;

/// TCP 传输绑定
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    strategy: SelectStrategy,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置客户端的节点选择策略
    pub fn with_strategy(mut self, strategy: SelectStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

impl TransportBinding for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn create_transport(&self, settings: TransportSettings) -> TransportPair {
        let client = TcpClient::new(settings.registry, settings.security.clone())
            .with_strategy(self.strategy);
        let server = TcpServer::new(settings.address, settings.security)
            .with_shutdown_timeout(settings.shutdown_timeout);

        TransportPair {
            client: Arc::new(client),
            server: Arc::new(server),
        }
    }
}
