//! 微服务运行时
//!
//! 把通用的运行时绑定到具体传输层，并管理服务在注册中心中的完整生命周期。
//!
//! # 设计理念
//!
//! 1. **能力接口**：运行时只依赖 `Client` / `Server`，线协议由 `TransportBinding` 提供
//! 2. **有序选项**：框架默认值、模式默认值、用户选项依次折叠为不可变的 [`Options`]
//! 3. **单一状态闸门**：租约状态的所有迁移都经过 [`LeaseGate`]
//! 4. **保证释放**：任何退出路径都会停止服务端并注销，且只注销一次
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use flare_micro::runtime::{new_service, options, OptionSet};
//! use std::time::Duration;
//!
//! # async fn demo() -> flare_micro::error::Result<()> {
//! let service = new_service(
//!     OptionSet::new()
//!         .with(options::name("greeter"))
//!         .with(options::register_ttl(Duration::from_secs(30)))
//!         .with(options::register_interval(Duration::from_secs(15))),
//! )?;
//! service.run().await
//! # }
//! ```

pub mod builder;
pub mod invocation;
pub mod lease;
pub mod manager;
pub mod options;
#[allow(clippy::module_inception)]
pub mod runtime;

pub use builder::{RuntimeBuilder, new_function, new_service};
pub use invocation::InvocationAdapter;
pub use lease::{LeaseGate, LeaseSnapshot, LeaseState, RegistrationLease};
pub use manager::{ActiveLease, RegistrationManager, Renewal};
pub use options::{Hook, Hooks, Mode, OptionKey, OptionSet, Options, RuntimeOption};
pub use runtime::Runtime;
