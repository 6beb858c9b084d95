//! 运行时构建
//!
//! 合并顺序：框架默认值 < 模式默认值 < 用户选项，后一层覆盖前一层的同名选项。

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::debug;

use super::invocation::InvocationAdapter;
use super::lease::LeaseGate;
use super::manager::RegistrationManager;
use super::options::{
    self, FUNCTION_REGISTER_INTERVAL, FUNCTION_REGISTER_TTL, Mode, OptionSet, Options,
};
use super::runtime::{Runtime, RuntimeInner};
use crate::error::Result;
use crate::transport::TransportSettings;

/// 运行时构建器
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeBuilder;

impl RuntimeBuilder {
    /// 各模式注入的默认选项
    ///
    /// Service 模式不注入 TTL / 续期间隔，沿用注册中心自身的默认值；
    /// Function 模式使用短租约，崩溃的函数不会在注册中心里长期残留。
    pub fn mode_defaults(mode: Mode) -> OptionSet {
        let defaults = OptionSet::new().with(options::mode(mode));
        match mode {
            Mode::Service => defaults,
            Mode::Function => defaults
                .with(options::register_ttl(FUNCTION_REGISTER_TTL))
                .with(options::register_interval(FUNCTION_REGISTER_INTERVAL)),
        }
    }

    /// 构建运行时
    ///
    /// 只做校验与组装，不产生任何网络活动；注册在 `run()` 中进行。
    pub fn build(mode: Mode, defaults: OptionSet, user: OptionSet) -> Result<Runtime> {
        let merged = OptionSet::new()
            .with(options::mode(mode))
            .merge(defaults)
            .merge(user);
        let mut options = merged.fold(Options::framework_defaults());
        options.validate()?;

        let (client, server) = match (options.client.clone(), options.server.clone()) {
            (Some(client), Some(server)) => (client, server),
            (client, server) => {
                let pair = options.transport.create_transport(TransportSettings {
                    address: options.address,
                    registry: options.registry.clone(),
                    security: options.security.clone(),
                    shutdown_timeout: options.shutdown_timeout,
                });
                (client.unwrap_or(pair.client), server.unwrap_or(pair.server))
            }
        };
        options.client = Some(client.clone());
        options.server = Some(server.clone());

        let gate = Arc::new(LeaseGate::new());
        let invocation = match options.mode {
            Mode::Function => Some(Arc::new(InvocationAdapter::new(gate.clone()))),
            Mode::Service => None,
        };
        let manager = RegistrationManager::new(options.registry.clone(), options.register_backoff.clone());

        debug!(options = ?options, "Runtime built");

        Ok(Runtime::from_inner(RuntimeInner {
            options,
            client,
            server,
            manager,
            gate,
            invocation,
            interceptors_installed: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }))
    }
}

/// 创建常驻服务
pub fn new_service(user: OptionSet) -> Result<Runtime> {
    RuntimeBuilder::build(Mode::Service, RuntimeBuilder::mode_defaults(Mode::Service), user)
}

/// 创建单次调用函数
pub fn new_function(user: OptionSet) -> Result<Runtime> {
    RuntimeBuilder::build(Mode::Function, RuntimeBuilder::mode_defaults(Mode::Function), user)
}
