//! 微服务运行时实现
//!
//! `run()` 的执行顺序：
//! 1. 绑定监听地址，生成服务描述（节点地址取实际绑定的端口）
//! 2. `before_start` 钩子
//! 3. 注册（失败按退避重试，直到成功或被取消）
//! 4. 启动服务端并启动续期
//! 5. `after_start` 钩子（此时租约已是 `Active`）
//! 6. 等待：取消 / 信号 / 服务端退出 / （Function）唯一一次调用完成
//! 7. 释放租约：停止续期、`before_stop`、停止服务端、注销、`after_stop`

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::invocation::InvocationAdapter;
use super::lease::{LeaseGate, LeaseSnapshot, LeaseState, RegistrationLease};
use super::manager::RegistrationManager;
use super::options::{Hook, Mode, Options};
use crate::error::{Result, RuntimeError};
use crate::transport::{Client, Handler, LoggingInterceptor, Server};
use crate::types::{Node, ServiceDescriptor};

pub(crate) struct RuntimeInner {
    pub(crate) options: Options,
    pub(crate) client: Arc<dyn Client>,
    pub(crate) server: Arc<dyn Server>,
    pub(crate) manager: RegistrationManager,
    pub(crate) gate: Arc<LeaseGate>,
    pub(crate) invocation: Option<Arc<InvocationAdapter>>,
    pub(crate) interceptors_installed: AtomicBool,
    pub(crate) running: AtomicBool,
}

/// `run()` 期间持有，退出时复位
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 等待阶段结束的原因
#[derive(Debug)]
enum Exit {
    Cancelled,
    Signal,
    ServerClosed,
    InvocationCompleted,
}

/// 微服务运行时
///
/// Service 与 Function 是同一类型的两种配置。
///
/// ```rust,no_run
/// use flare_micro::runtime::{new_function, options, OptionSet};
/// use flare_micro::transport::ServiceHandler;
/// use std::sync::Arc;
///
/// # async fn demo() -> flare_micro::error::Result<()> {
/// let function = new_function(OptionSet::new().with(options::name("greeter")))?;
/// function
///     .handle(Arc::new(ServiceHandler::new("Say").endpoint("Hello", |name: String| async move {
///         Ok(format!("Hello {}", name))
///     })))
///     .await?;
/// function.run().await
/// # }
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub(crate) fn from_inner(inner: RuntimeInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn mode(&self) -> Mode {
        self.inner.options.mode
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn client(&self) -> Arc<dyn Client> {
        self.inner.client.clone()
    }

    pub fn server(&self) -> Arc<dyn Server> {
        self.inner.server.clone()
    }

    /// 挂载处理器
    pub async fn handle(&self, handler: Arc<dyn Handler>) -> Result<()> {
        self.inner.server.handle(handler).await.map_err(RuntimeError::server)
    }

    /// 当前租约状态
    pub fn state(&self) -> LeaseState {
        self.inner.gate.state()
    }

    /// 订阅租约状态变化
    pub fn subscribe(&self) -> watch::Receiver<LeaseSnapshot> {
        self.inner.gate.subscribe()
    }

    /// 运行直到取消、致命错误或（Function 模式）唯一一次调用完成
    ///
    /// 仅在正常关闭且注销流程已执行时返回 `Ok(())`。
    pub async fn run(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RuntimeError::config("runtime is already running"));
        }
        let _running = RunningGuard(&inner.running);

        if inner.invocation.as_ref().is_some_and(|adapter| adapter.is_spent()) {
            return Err(RuntimeError::config("function has already served its invocation"));
        }

        let options = &inner.options;
        let server = inner.server.clone();
        self.install_interceptors().await;

        let address = server.listen().await.map_err(RuntimeError::server)?;
        let descriptor = self.descriptor(address).await;
        info!(
            service = %descriptor.name,
            version = %descriptor.version,
            mode = %options.mode,
            address = %address,
            endpoints = descriptor.endpoints.len(),
            "🚀 Starting runtime"
        );

        if let Err(e) = run_hook(options.hooks.before_start.as_ref()).await {
            error!(service = %descriptor.name, error = %format!("{:#}", e), "❌ before_start hook failed");
            self.unbind(&server).await;
            return Err(RuntimeError::Startup(format!("before_start hook: {:#}", e)));
        }

        // Function 等待调用期间同样续期，调用完成后随释放一起停止
        let lease = RegistrationLease::new(
            descriptor,
            options.register_ttl,
            options.register_interval,
            inner.gate.clone(),
        );

        if let Err(e) = inner.manager.register(&lease, &options.context).await {
            self.unbind(&server).await;
            return Err(e);
        }
        let mut active = inner
            .manager
            .activate(lease.clone(), server.clone(), options.hooks.clone());

        let outcome = match server.start().await {
            Err(e) => {
                error!(service = %self.name(), error = %e, "❌ Server failed to start");
                Err(RuntimeError::server(e))
            }
            Ok(()) => {
                active.attach_renewal(
                    inner
                        .manager
                        .spawn_renewal(&lease, options.context.child_token()),
                );

                match run_hook(options.hooks.after_start.as_ref()).await {
                    Err(e) => {
                        error!(service = %self.name(), error = %format!("{:#}", e), "❌ after_start hook failed");
                        Err(RuntimeError::Startup(format!("after_start hook: {:#}", e)))
                    }
                    Ok(()) => self.wait(server.as_ref()).await,
                }
            }
        };

        let released = active.release().await;
        info!(service = %self.name(), success = outcome.is_ok(), "Runtime stopped");

        // 先发生的致命错误优先
        outcome.and(released)
    }

    async fn install_interceptors(&self) {
        let inner = &self.inner;
        if inner.interceptors_installed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.server.intercept(Arc::new(LoggingInterceptor::new())).await;
        if let Some(adapter) = &inner.invocation {
            inner.server.intercept(adapter.clone()).await;
        }
    }

    async fn descriptor(&self, address: SocketAddr) -> ServiceDescriptor {
        let options = &self.inner.options;
        let node_id = format!("{}-{}", options.name, uuid::Uuid::new_v4());
        let node = options
            .metadata
            .iter()
            .fold(Node::new(node_id, address), |node, (key, value)| {
                node.with_metadata(key.clone(), value.clone())
            });

        ServiceDescriptor::new(options.name.clone(), options.version.clone())
            .with_node(node)
            .with_endpoints(self.inner.server.endpoints().await)
    }

    async fn unbind(&self, server: &Arc<dyn Server>) {
        if let Err(e) = server.stop().await {
            warn!(service = %self.name(), error = %e, "⚠️ Failed to release listener");
        }
    }

    async fn wait(&self, server: &dyn Server) -> Result<()> {
        let options = &self.inner.options;
        let completed = self.inner.invocation.as_ref().map(|adapter| adapter.completed());
        let invocation_done = async {
            match &completed {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let exit = tokio::select! {
            _ = options.context.cancelled() => Exit::Cancelled,
            _ = shutdown_signal(options.handle_signal) => Exit::Signal,
            _ = invocation_done => Exit::InvocationCompleted,
            closed = server.closed() => match closed {
                Ok(()) => Exit::ServerClosed,
                Err(e) => {
                    error!(service = %self.name(), error = %e, "❌ Server failed while serving");
                    return Err(RuntimeError::server(e));
                }
            },
        };

        info!(service = %self.name(), reason = ?exit, "Shutting down");
        Ok(())
    }
}

async fn run_hook(hook: Option<&Hook>) -> anyhow::Result<()> {
    match hook {
        Some(hook) => hook().await,
        None => Ok(()),
    }
}

/// SIGINT / SIGTERM；未启用时永不完成
async fn shutdown_signal(enabled: bool) {
    if !enabled {
        return std::future::pending().await;
    }

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c => info!("Shutdown signal received (Ctrl+C)"),
                    _ = terminate.recv() => info!("Shutdown signal received (SIGTERM)"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                ctrl_c.await;
                info!("Shutdown signal received (Ctrl+C)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Shutdown signal received (Ctrl+C)");
    }
}
