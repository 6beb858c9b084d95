//! 注册租约
//!
//! 租约状态是运行时唯一的共享可变状态，所有状态迁移都经过 [`LeaseGate`]：
//! 迁移以比较并交换的方式完成，续期与调用准入在同一把锁内检查状态，
//! 一旦进入 `Deregistering`，不会再有新的续期或调用开始。

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::types::ServiceDescriptor;

/// 租约状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseState {
    #[default]
    Unregistered,
    Registering,
    Active,
    Deregistering,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeaseState::Unregistered => "unregistered",
            LeaseState::Registering => "registering",
            LeaseState::Active => "active",
            LeaseState::Deregistering => "deregistering",
        };
        f.write_str(s)
    }
}

/// 租约快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub state: LeaseState,
    pub last_renewed_at: Option<DateTime<Utc>>,
    /// 成功的续期次数（不含首次注册）
    pub renewals: u64,
}

/// 状态迁移闸门
#[derive(Debug)]
pub struct LeaseGate {
    snapshot: watch::Sender<LeaseSnapshot>,
}

impl Default for LeaseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseGate {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(LeaseSnapshot::default());
        Self { snapshot }
    }

    pub fn state(&self) -> LeaseState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> LeaseSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaseSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LeaseState::Active
    }

    /// 仅当当前状态为 `from` 时迁移到 `to`，返回是否迁移成功
    pub fn transition(&self, from: LeaseState, to: LeaseState) -> bool {
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.state != from {
                return false;
            }
            snapshot.state = to;
            if to == LeaseState::Active {
                snapshot.last_renewed_at = Some(Utc::now());
            }
            true
        })
    }

    /// 在 `Active` 状态下执行 `admit`；`admit` 在闸门锁内运行，不能阻塞
    ///
    /// 状态不是 `Active` 时返回 `None`。
    pub fn admit<T>(&self, admit: impl FnOnce() -> T) -> Option<T> {
        let mut outcome = None;
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.state == LeaseState::Active {
                outcome = Some(admit());
            }
            false
        });
        outcome
    }

    /// 记录一次成功续期（非 `Active` 时忽略）
    pub fn record_renewal(&self) -> bool {
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.state != LeaseState::Active {
                return false;
            }
            snapshot.last_renewed_at = Some(Utc::now());
            snapshot.renewals += 1;
            true
        })
    }
}

/// 一次 `run()` 的注册租约，不跨 `run()` 复用
#[derive(Debug, Clone)]
pub struct RegistrationLease {
    pub descriptor: Arc<ServiceDescriptor>,
    pub ttl: Option<Duration>,
    pub renew_interval: Option<Duration>,
    pub gate: Arc<LeaseGate>,
}

impl RegistrationLease {
    pub fn new(
        descriptor: ServiceDescriptor,
        ttl: Option<Duration>,
        renew_interval: Option<Duration>,
        gate: Arc<LeaseGate>,
    ) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            ttl,
            renew_interval,
            gate,
        }
    }

    pub fn state(&self) -> LeaseState {
        self.gate.state()
    }
}
