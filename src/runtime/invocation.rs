//! Function 模式的单次调用适配器
//!
//! 作为拦截器挂在分发路径最前面：只有租约处于 `Active` 时才放行，
//! 且整个进程生命周期只放行第一次调用；该调用完成（无论成败）后发出完成信号，
//! 运行时随即进入注销流程。

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{info, warn};

use super::lease::LeaseGate;
use crate::transport::Interceptor;
use crate::transport::frame::Request;

/// 单次调用适配器
#[derive(Debug)]
pub struct InvocationAdapter {
    gate: Arc<LeaseGate>,
    admitted: AtomicBool,
    completed: CancellationToken,
}

impl InvocationAdapter {
    pub fn new(gate: Arc<LeaseGate>) -> Self {
        Self {
            gate,
            admitted: AtomicBool::new(false),
            completed: CancellationToken::new(),
        }
    }

    /// 唯一一次调用完成后被取消的 token
    pub fn completed(&self) -> CancellationToken {
        self.completed.clone()
    }

    /// 是否已经放行过调用
    pub fn is_spent(&self) -> bool {
        self.admitted.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Interceptor for InvocationAdapter {
    async fn before(&self, request: &Request) -> Result<(), Status> {
        // 准入判断与状态检查在同一把闸门锁内完成
        let admitted = self.gate.admit(|| {
            self.admitted
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });

        match admitted {
            Some(true) => {
                info!(
                    request_id = request.id,
                    endpoint = %request.endpoint,
                    "Function invocation admitted"
                );
                Ok(())
            }
            Some(false) => {
                warn!(endpoint = %request.endpoint, "Function already served its invocation, rejecting");
                Err(Status::resource_exhausted("function has already served its invocation"))
            }
            None => {
                warn!(
                    endpoint = %request.endpoint,
                    state = %self.gate.state(),
                    "Function is not accepting invocations"
                );
                Err(Status::unavailable("function is not accepting invocations"))
            }
        }
    }

    async fn after(&self, request: &Request, outcome: &Result<Value, Status>) {
        info!(
            request_id = request.id,
            endpoint = %request.endpoint,
            success = outcome.is_ok(),
            "Function invocation completed"
        );
        self.completed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::lease::LeaseState;
    use serde_json::json;

    fn request() -> Request {
        Request {
            id: 1,
            service: "fn".into(),
            endpoint: "Say.Hello".into(),
            headers: Default::default(),
            body: json!({}),
        }
    }

    fn active_gate() -> Arc<LeaseGate> {
        let gate = Arc::new(LeaseGate::new());
        gate.transition(LeaseState::Unregistered, LeaseState::Registering);
        gate.transition(LeaseState::Registering, LeaseState::Active);
        gate
    }

    #[tokio::test]
    async fn rejects_before_active() {
        let adapter = InvocationAdapter::new(Arc::new(LeaseGate::new()));
        let err = adapter.before(&request()).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
        assert!(!adapter.is_spent());
    }

    #[tokio::test]
    async fn admits_exactly_once() {
        let adapter = InvocationAdapter::new(active_gate());
        tokio_test::assert_ok!(adapter.before(&request()).await);
        let err = tokio_test::assert_err!(adapter.before(&request()).await);
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
        assert!(adapter.is_spent());

        assert!(!adapter.completed().is_cancelled());
        adapter.after(&request(), &Ok(json!(null))).await;
        assert!(adapter.completed().is_cancelled());
    }

    #[tokio::test]
    async fn rejects_once_deregistering() {
        let gate = active_gate();
        let adapter = InvocationAdapter::new(gate.clone());
        gate.transition(LeaseState::Active, LeaseState::Deregistering);
        assert_eq!(
            adapter.before(&request()).await.unwrap_err().code(),
            tonic::Code::Unavailable
        );
        assert!(!adapter.is_spent());
    }
}
