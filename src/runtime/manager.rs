//! 注册生命周期管理
//!
//! 状态机：`Unregistered -> Registering -> Active -> Deregistering -> Unregistered`。
//!
//! - 首次注册失败按指数退避重试，直到成功或被取消；
//! - `Active` 后按续期间隔重复注册（Function 在等待唯一一次调用期间同样续期），失败只记日志；
//! - 释放租约时先停止续期、再停止服务端、最后注销，整个过程每次 `run()` 只执行一次。

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lease::{LeaseState, RegistrationLease};
use super::options::{Hook, Hooks};
use crate::error::{Result, RuntimeError};
use crate::registry::Registry;
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};
use crate::transport::Server;

/// 注册管理器
#[derive(Clone)]
pub struct RegistrationManager {
    registry: Arc<dyn Registry>,
    backoff: ExponentialBackoffPolicy,
}

impl RegistrationManager {
    pub fn new(registry: Arc<dyn Registry>, backoff: ExponentialBackoffPolicy) -> Self {
        Self { registry, backoff }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// 首次注册：`Unregistered -> Registering -> Active`
    ///
    /// 注册调用本身不会被取消打断，取消只在两次尝试之间生效。
    pub async fn register(&self, lease: &RegistrationLease, cancel: &CancellationToken) -> Result<()> {
        let descriptor = &lease.descriptor;
        if !lease.gate.transition(LeaseState::Unregistered, LeaseState::Registering) {
            return Err(RuntimeError::Registration {
                service: descriptor.name.clone(),
                attempts: 0,
                reason: format!("lease is {}", lease.state()),
            });
        }

        let mut guard = RegisteringGuard {
            lease,
            registry: self.registry.clone(),
            in_flight: false,
            armed: true,
        };
        let mut attempts = 0;
        let mut last_error = String::from("cancelled before first registration");

        while !cancel.is_cancelled() {
            attempts += 1;
            guard.in_flight = true;
            let registered = self.registry.register(descriptor, lease.ttl).await;
            guard.in_flight = false;

            match registered {
                Ok(()) => {
                    guard.armed = false;
                    lease.gate.transition(LeaseState::Registering, LeaseState::Active);
                    info!(
                        service = %descriptor.name,
                        version = %descriptor.version,
                        registry = %self.registry.name(),
                        attempts = attempts,
                        ttl = ?lease.ttl,
                        "✅ Service registered"
                    );
                    return Ok(());
                }
                Err(e) => {
                    let delay = self.backoff.backoff_duration(attempts - 1);
                    warn!(
                        service = %descriptor.name,
                        attempt = attempts,
                        retry_in = ?delay,
                        error = %e,
                        "⚠️ Registration failed, retrying"
                    );
                    last_error = e.to_string();

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        guard.armed = false;
        lease.gate.transition(LeaseState::Registering, LeaseState::Unregistered);
        error!(
            service = %descriptor.name,
            attempts = attempts,
            "❌ Registration cancelled before it succeeded"
        );
        Err(RuntimeError::Registration {
            service: descriptor.name.clone(),
            attempts,
            reason: last_error,
        })
    }

    /// 已经 `Active` 的租约交给守卫，由守卫负责释放
    pub fn activate(
        &self,
        lease: RegistrationLease,
        server: Arc<dyn Server>,
        hooks: Hooks,
    ) -> ActiveLease {
        ActiveLease {
            lease,
            registry: self.registry.clone(),
            server,
            hooks,
            renewal: None,
            released: false,
        }
    }

    /// 启动续期任务；租约没有续期间隔时不启动
    pub fn spawn_renewal(&self, lease: &RegistrationLease, shutdown: CancellationToken) -> Option<Renewal> {
        let interval = lease.renew_interval?;
        let lease = lease.clone();
        let registry = self.registry.clone();
        let stop = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !lease.gate.is_active() {
                    break;
                }

                match registry.register(&lease.descriptor, lease.ttl).await {
                    Ok(()) => {
                        lease.gate.record_renewal();
                        debug!(service = %lease.descriptor.name, "Lease renewed");
                    }
                    Err(e) => {
                        let err = RuntimeError::Renewal(e.to_string());
                        warn!(
                            service = %lease.descriptor.name,
                            kind = %err.kind(),
                            error = %err,
                            "⚠️ Lease renewal failed, retrying on next tick"
                        );
                    }
                }
            }
            debug!(service = %lease.descriptor.name, "Renewal loop stopped");
        });

        Some(Renewal { shutdown, handle })
    }
}

/// 运行中的续期任务
#[derive(Debug)]
pub struct Renewal {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Renewal {
    /// 停止并等待续期任务退出
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "Renewal task terminated abnormally");
        }
    }
}

impl Drop for Renewal {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 注册进行中的守卫
///
/// `register` 的 future 在 `Registering` 状态下被丢弃时，把租约退回 `Unregistered`；
/// 若当时有一次注册调用尚未返回（可能已经写入），在后台补一次注销。
struct RegisteringGuard<'a> {
    lease: &'a RegistrationLease,
    registry: Arc<dyn Registry>,
    in_flight: bool,
    armed: bool,
}

impl Drop for RegisteringGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let descriptor = self.lease.descriptor.clone();
        self.lease
            .gate
            .transition(LeaseState::Registering, LeaseState::Unregistered);
        warn!(service = %descriptor.name, "⚠️ Registration abandoned");

        if !self.in_flight {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.registry.clone();
        handle.spawn(async move {
            match registry.deregister(&descriptor).await {
                Ok(()) => info!(service = %descriptor.name, "Abandoned registration withdrawn"),
                Err(e) => warn!(
                    service = %descriptor.name,
                    error = %e,
                    "⚠️ Failed to withdraw abandoned registration, relying on ttl"
                ),
            }
        });
    }
}

/// 注销进行中的守卫
///
/// 释放流程在 `Deregistering` 状态下被丢弃时，在后台停止服务端、注销，并回到 `Unregistered`。
struct DeregisteringGuard {
    lease: RegistrationLease,
    registry: Arc<dyn Registry>,
    server: Arc<dyn Server>,
    armed: bool,
}

impl Drop for DeregisteringGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.lease
                .gate
                .transition(LeaseState::Deregistering, LeaseState::Unregistered);
            return;
        };

        let lease = self.lease.clone();
        let registry = self.registry.clone();
        let server = self.server.clone();
        handle.spawn(async move {
            let descriptor = &lease.descriptor;
            if let Err(e) = server.stop().await {
                warn!(service = %descriptor.name, error = %e, "⚠️ Server did not stop cleanly");
            }
            if let Err(e) = registry.deregister(descriptor).await {
                warn!(service = %descriptor.name, error = %e, "⚠️ Deregistration failed, relying on ttl expiry");
            }
            lease
                .gate
                .transition(LeaseState::Deregistering, LeaseState::Unregistered);
            info!(service = %descriptor.name, "Interrupted release completed");
        });
    }
}

/// 处于 `Active` 的租约守卫
///
/// 正常路径调用 [`ActiveLease::release`]；若守卫在释放前被丢弃（例如 `run()` 的 future
/// 被取消），Drop 会在后台完成停止与注销。
pub struct ActiveLease {
    lease: RegistrationLease,
    registry: Arc<dyn Registry>,
    server: Arc<dyn Server>,
    hooks: Hooks,
    renewal: Option<Renewal>,
    released: bool,
}

impl ActiveLease {
    pub fn lease(&self) -> &RegistrationLease {
        &self.lease
    }

    pub fn attach_renewal(&mut self, renewal: Option<Renewal>) {
        self.renewal = renewal;
    }

    /// `Active -> Deregistering -> Unregistered`
    ///
    /// 返回停止钩子的错误；注销失败只记录日志。
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let renewal = self.renewal.take();
        release_lease(
            &self.lease,
            &self.registry,
            &self.server,
            renewal,
            Some(&self.hooks),
        )
        .await
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        if self.released || self.lease.state() != LeaseState::Active {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                service = %self.lease.descriptor.name,
                "⚠️ No runtime available to deregister dropped lease, relying on ttl"
            );
            return;
        };

        let lease = self.lease.clone();
        let registry = self.registry.clone();
        let server = self.server.clone();
        let renewal = self.renewal.take();
        handle.spawn(async move {
            if let Err(e) = release_lease(&lease, &registry, &server, renewal, None).await {
                warn!(error = %e, "Release from drop reported an error");
            }
            info!(service = %lease.descriptor.name, "Lease released (from Drop)");
        });
    }
}

async fn run_hook(name: &str, hook: Option<&Hook>) -> Option<RuntimeError> {
    let hook = hook?;
    match hook().await {
        Ok(()) => None,
        Err(e) => {
            error!(hook = name, error = %format!("{:#}", e), "❌ Lifecycle hook failed");
            Some(RuntimeError::Shutdown(format!("{} hook: {:#}", name, e)))
        }
    }
}

async fn release_lease(
    lease: &RegistrationLease,
    registry: &Arc<dyn Registry>,
    server: &Arc<dyn Server>,
    renewal: Option<Renewal>,
    hooks: Option<&Hooks>,
) -> Result<()> {
    let descriptor = &lease.descriptor;
    if !lease.gate.transition(LeaseState::Active, LeaseState::Deregistering) {
        debug!(service = %descriptor.name, state = %lease.state(), "Lease already released");
        return Ok(());
    }
    info!(service = %descriptor.name, "Deregistering service");
    let mut guard = DeregisteringGuard {
        lease: lease.clone(),
        registry: registry.clone(),
        server: server.clone(),
        armed: true,
    };

    if let Some(renewal) = renewal {
        renewal.stop().await;
    }

    let mut failure = None;
    if let Some(err) = run_hook("before_stop", hooks.and_then(|h| h.before_stop.as_ref())).await {
        failure.get_or_insert(err);
    }

    if let Err(e) = server.stop().await {
        warn!(service = %descriptor.name, error = %e, "⚠️ Server did not stop cleanly");
    }

    match registry.deregister(descriptor).await {
        Ok(()) => info!(
            service = %descriptor.name,
            registry = %registry.name(),
            "✅ Service deregistered"
        ),
        Err(e) => {
            let err = RuntimeError::Deregistration(e.to_string());
            warn!(
                service = %descriptor.name,
                kind = %err.kind(),
                error = %err,
                "⚠️ Deregistration failed, relying on ttl expiry"
            );
        }
    }

    guard.armed = false;
    lease.gate.transition(LeaseState::Deregistering, LeaseState::Unregistered);

    if let Some(err) = run_hook("after_stop", hooks.and_then(|h| h.after_stop.as_ref())).await {
        failure.get_or_insert(err);
    }

    failure.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use crate::registry::MemoryRegistry;
    use crate::runtime::lease::LeaseGate;
    use crate::transport::TcpServer;
    use crate::types::{Node, ServiceDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FlakyRegistry {
        inner: MemoryRegistry,
        failures_left: AtomicUsize,
        registers: AtomicUsize,
        deregisters: AtomicUsize,
    }

    #[async_trait]
    impl Registry for FlakyRegistry {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn register(
            &self,
            descriptor: &ServiceDescriptor,
            ttl: Option<Duration>,
        ) -> std::result::Result<(), RegistryError> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(RegistryError::Unavailable("down".into()));
            }
            self.inner.register(descriptor, ttl).await
        }

        async fn deregister(&self, descriptor: &ServiceDescriptor) -> std::result::Result<(), RegistryError> {
            self.deregisters.fetch_add(1, Ordering::SeqCst);
            self.inner.deregister(descriptor).await
        }

        async fn resolve(&self, name: &str) -> std::result::Result<Vec<Node>, RegistryError> {
            self.inner.resolve(name).await
        }
    }

    fn lease(ttl: Option<Duration>, interval: Option<Duration>) -> RegistrationLease {
        let descriptor = ServiceDescriptor::new("svc", "1.0")
            .with_node(Node::new("svc-1", "127.0.0.1:1".parse().unwrap()));
        RegistrationLease::new(descriptor, ttl, interval, Arc::new(LeaseGate::new()))
    }

    fn manager(registry: Arc<FlakyRegistry>) -> RegistrationManager {
        RegistrationManager::new(
            registry,
            ExponentialBackoffPolicy::unbounded(Duration::from_millis(10), Duration::from_millis(40)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn register_retries_until_success() {
        let registry = Arc::new(FlakyRegistry::default());
        registry.failures_left.store(2, Ordering::SeqCst);
        let lease = lease(None, None);

        manager(registry.clone()).register(&lease, &CancellationToken::new()).await.unwrap();
        assert_eq!(registry.registers.load(Ordering::SeqCst), 3);
        assert_eq!(lease.state(), LeaseState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_registration_returns_to_unregistered() {
        let registry = Arc::new(FlakyRegistry::default());
        registry.failures_left.store(usize::MAX, Ordering::SeqCst);
        let lease = lease(None, None);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(25)).await;
                cancel.cancel();
            })
        };

        let err = manager(registry).register(&lease, &cancel).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, RuntimeError::Registration { attempts, .. } if attempts >= 2));
        assert_eq!(lease.state(), LeaseState::Unregistered);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_ticks_and_release_runs_once() {
        let registry = Arc::new(FlakyRegistry::default());
        let lease = lease(Some(Duration::from_secs(60)), Some(Duration::from_secs(30)));
        let manager = manager(registry.clone());
        manager.register(&lease, &CancellationToken::new()).await.unwrap();

        let server: Arc<dyn Server> = Arc::new(TcpServer::new("127.0.0.1:0".parse().unwrap(), None));
        let mut active = manager.activate(lease.clone(), server, Hooks::default());
        active.attach_renewal(manager.spawn_renewal(&lease, CancellationToken::new()));

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(registry.registers.load(Ordering::SeqCst), 3);
        assert_eq!(lease.gate.snapshot().renewals, 2);

        active.release().await.unwrap();
        assert_eq!(registry.deregisters.load(Ordering::SeqCst), 1);
        assert_eq!(lease.state(), LeaseState::Unregistered);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.registers.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_registration_returns_to_unregistered() {
        let registry = Arc::new(FlakyRegistry::default());
        registry.failures_left.store(usize::MAX, Ordering::SeqCst);
        let lease = lease(None, None);

        let registering = tokio::spawn({
            let manager = manager(registry.clone());
            let lease = lease.clone();
            async move { manager.register(&lease, &CancellationToken::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(lease.state(), LeaseState::Registering);

        registering.abort();
        assert!(registering.await.unwrap_err().is_cancelled());
        assert_eq!(lease.state(), LeaseState::Unregistered);

        // 闸门已复位，可以重新注册
        registry.failures_left.store(0, Ordering::SeqCst);
        manager(registry.clone()).register(&lease, &CancellationToken::new()).await.unwrap();
        assert_eq!(lease.state(), LeaseState::Active);
    }

    #[tokio::test]
    async fn dropped_guard_still_deregisters() {
        let registry = Arc::new(FlakyRegistry::default());
        let lease = lease(None, None);
        let manager = manager(registry.clone());
        manager.register(&lease, &CancellationToken::new()).await.unwrap();

        let server: Arc<dyn Server> = Arc::new(TcpServer::new("127.0.0.1:0".parse().unwrap(), None));
        let mut states = lease.gate.subscribe();
        drop(manager.activate(lease.clone(), server, Hooks::default()));

        states
            .wait_for(|s| s.state == LeaseState::Unregistered)
            .await
            .unwrap();
        assert_eq!(registry.deregisters.load(Ordering::SeqCst), 1);
    }
}
