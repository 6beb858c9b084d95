//! 服务注册发现模块
//!
//! 运行时只依赖 [`Registry`] trait：`register` 需要对同一身份幂等（续期即重复注册），
//! `deregister` 移除本描述中的节点，`resolve` 返回某个服务名下所有存活节点。

pub mod memory;
pub mod selector;

#[cfg(feature = "etcd")]
pub mod etcd;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::RegistryError;
use crate::types::{Node, ServiceDescriptor};

pub use memory::MemoryRegistry;
pub use selector::{SelectStrategy, Selector};

#[cfg(feature = "etcd")]
pub use etcd::EtcdRegistry;

/// 服务注册中心 Trait
///
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait Registry: Send + Sync {
    /// 后端名称（用于日志）
    fn name(&self) -> &str;

    /// 注册服务；`ttl` 为 `None` 时使用后端自身的默认值
    async fn register(
        &self,
        descriptor: &ServiceDescriptor,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError>;

    /// 注销服务
    async fn deregister(&self, descriptor: &ServiceDescriptor) -> Result<(), RegistryError>;

    /// 解析服务名下的全部节点
    async fn resolve(&self, name: &str) -> Result<Vec<Node>, RegistryError>;
}
