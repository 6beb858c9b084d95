//! 进程内注册中心
//!
//! 适用于测试与单进程部署。记录按 名称 → 版本 → 节点 ID 组织，
//! 过期判断使用 `tokio::time::Instant`，在暂停时钟的测试中同样确定。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::Registry;
use crate::error::RegistryError;
use crate::types::{Endpoint, Node, ServiceDescriptor};

#[derive(Debug, Clone)]
struct NodeRecord {
    node: Node,
    endpoints: Vec<Endpoint>,
    expires_at: Option<Instant>,
}

impl NodeRecord {
    fn is_alive(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

type VersionMap = HashMap<String, HashMap<String, NodeRecord>>;

/// 内存注册中心
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    services: Arc<RwLock<HashMap<String, VersionMap>>>,
    default_ttl: Option<Duration>,
}

impl MemoryRegistry {
    /// 创建新的内存注册中心（未指定 TTL 的记录永不过期）
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置默认 TTL（调用方未传 TTL 时使用）
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// 获取当前存活的服务快照（每个版本一条描述）
    pub async fn services(&self) -> Vec<ServiceDescriptor> {
        let now = Instant::now();
        let services = self.services.read().await;
        let mut out = Vec::new();
        for (name, versions) in services.iter() {
            for (version, nodes) in versions.iter() {
                let alive: Vec<&NodeRecord> = nodes.values().filter(|r| r.is_alive(now)).collect();
                if alive.is_empty() {
                    continue;
                }
                let endpoints = alive
                    .iter()
                    .flat_map(|r| r.endpoints.iter().cloned())
                    .collect::<Vec<_>>();
                let mut descriptor =
                    ServiceDescriptor::new(name.clone(), version.clone()).with_endpoints(endpoints);
                descriptor.nodes = alive.iter().map(|r| r.node.clone()).collect();
                out.push(descriptor);
            }
        }
        out
    }

    /// 清理已过期的记录
    async fn purge_expired(&self) {
        let now = Instant::now();
        let mut services = self.services.write().await;
        services.retain(|_, versions| {
            versions.retain(|_, nodes| {
                nodes.retain(|_, record| record.is_alive(now));
                !nodes.is_empty()
            });
            !versions.is_empty()
        });
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &str {
        "memory"
    }

    async fn register(
        &self,
        descriptor: &ServiceDescriptor,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError> {
        if descriptor.name.is_empty() {
            return Err(RegistryError::Backend("service name is empty".to_string()));
        }

        let expires_at = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);
        let mut services = self.services.write().await;
        let nodes = services
            .entry(descriptor.name.clone())
            .or_default()
            .entry(descriptor.version.clone())
            .or_default();

        for node in &descriptor.nodes {
            nodes.insert(
                node.id.clone(),
                NodeRecord {
                    node: node.clone(),
                    endpoints: descriptor.endpoints.clone(),
                    expires_at,
                },
            );
        }

        debug!(
            service = %descriptor.name,
            version = %descriptor.version,
            nodes = descriptor.nodes.len(),
            "Service registered in memory registry"
        );
        Ok(())
    }

    async fn deregister(&self, descriptor: &ServiceDescriptor) -> Result<(), RegistryError> {
        let mut services = self.services.write().await;
        if let Some(versions) = services.get_mut(&descriptor.name) {
            if let Some(nodes) = versions.get_mut(&descriptor.version) {
                for node in &descriptor.nodes {
                    nodes.remove(&node.id);
                }
                if nodes.is_empty() {
                    versions.remove(&descriptor.version);
                }
            }
            if versions.is_empty() {
                services.remove(&descriptor.name);
            }
        }
        Ok(())
    }

    async fn resolve(&self, name: &str) -> Result<Vec<Node>, RegistryError> {
        self.purge_expired().await;

        let services = self.services.read().await;
        let nodes: Vec<Node> = services
            .get(name)
            .map(|versions| {
                versions
                    .values()
                    .flat_map(|nodes| nodes.values().map(|r| r.node.clone()))
                    .collect()
            })
            .unwrap_or_default();

        if nodes.is_empty() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(nodes)
    }
}
