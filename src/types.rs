//! 服务描述信息
//!
//! `ServiceDescriptor` 是写入注册中心的记录：名称 + 版本构成身份，节点列表描述监听地址，
//! 端点列表来自挂载到 Server 上的 Handler。注册开始后描述即不可变。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// 服务节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    /// 节点 ID（唯一标识，形如 `<name>-<uuid>`）
    pub id: String,
    /// 节点地址
    pub address: SocketAddr,
    /// 节点元数据
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id: id.into(),
            address,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Handler 端点签名
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    /// 端点全名，形如 `Say.Hello`
    pub name: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// 服务描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            nodes: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// 设置端点（去重并排序，保证描述稳定）
    pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let mut endpoints: Vec<Endpoint> = endpoints.into_iter().collect();
        endpoints.sort();
        endpoints.dedup();
        self.endpoints = endpoints;
        self
    }

    /// 身份键：name，版本非空时为 `name:version`
    pub fn identity(&self) -> String {
        if self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.version)
        }
    }
}
