//! etcd 注册中心后端
//!
//! 每个节点一个 key：`<namespace>/services/<name>/<version>/<node_id>`，值为 JSON。
//! 指定 TTL 时为每次注册申请新的 lease 并绑定到 key，续期即重新注册。

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, PutOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::Registry;
use crate::error::RegistryError;
use crate::types::{Endpoint, Node, ServiceDescriptor};

/// 写入 etcd 的节点记录
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    name: String,
    version: String,
    node: Node,
    endpoints: Vec<Endpoint>,
}

/// etcd 注册中心
pub struct EtcdRegistry {
    client: Arc<Mutex<Client>>,
    namespace: String,
}

impl EtcdRegistry {
    /// 连接 etcd
    pub async fn connect(endpoints: &[String], namespace: impl Into<String>) -> Result<Self, RegistryError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            namespace: namespace.into(),
        })
    }

    fn service_prefix(&self, name: &str) -> String {
        format!("{}/services/{}/", self.namespace, name)
    }

    fn node_key(&self, descriptor: &ServiceDescriptor, node: &Node) -> String {
        format!(
            "{}{}/{}",
            self.service_prefix(&descriptor.name),
            descriptor.version,
            node.id
        )
    }
}

fn backend_error(err: etcd_client::Error) -> RegistryError {
    RegistryError::Backend(err.to_string())
}

#[async_trait]
impl Registry for EtcdRegistry {
    fn name(&self) -> &str {
        "etcd"
    }

    async fn register(
        &self,
        descriptor: &ServiceDescriptor,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError> {
        let mut client = self.client.lock().await;

        let lease_id = match ttl {
            Some(ttl) => {
                let lease = client
                    .lease_grant(ttl.as_secs().max(1) as i64, None)
                    .await
                    .map_err(backend_error)?;
                Some(lease.id())
            }
            None => None,
        };

        for node in &descriptor.nodes {
            let record = NodeRecord {
                name: descriptor.name.clone(),
                version: descriptor.version.clone(),
                node: node.clone(),
                endpoints: descriptor.endpoints.clone(),
            };
            let value = serde_json::to_vec(&record)?;
            client
                .put(
                    self.node_key(descriptor, node),
                    value,
                    lease_id.map(|id| PutOptions::new().with_lease(id)),
                )
                .await
                .map_err(backend_error)?;
        }

        debug!(service = %descriptor.name, "Service registered in etcd");
        Ok(())
    }

    async fn deregister(&self, descriptor: &ServiceDescriptor) -> Result<(), RegistryError> {
        let mut client = self.client.lock().await;
        for node in &descriptor.nodes {
            client
                .delete(self.node_key(descriptor, node), None)
                .await
                .map_err(backend_error)?;
        }
        Ok(())
    }

    async fn resolve(&self, name: &str) -> Result<Vec<Node>, RegistryError> {
        let mut client = self.client.lock().await;
        let resp = client
            .get(self.service_prefix(name), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend_error)?;

        let nodes: Vec<Node> = resp
            .kvs()
            .iter()
            .filter_map(|kv| serde_json::from_slice::<NodeRecord>(kv.value()).ok())
            .map(|record| record.node)
            .collect();

        if nodes.is_empty() {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(nodes)
    }
}
