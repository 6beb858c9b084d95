//! 集成测试共用工具
#![allow(dead_code)]

use async_trait::async_trait;
use flare_micro::error::RegistryError;
use flare_micro::registry::{MemoryRegistry, Registry};
use flare_micro::runtime::{LeaseState, Runtime};
use flare_micro::transport::{
    PeerVerification, SecurityContext, SecurityContextBuilder, ServiceHandler,
};
use flare_micro::types::{Node, ServiceDescriptor};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 记录调用次数与事件顺序的注册中心
#[derive(Default)]
pub struct CountingRegistry {
    inner: MemoryRegistry,
    registers: AtomicUsize,
    deregisters: AtomicUsize,
    fail_register: AtomicBool,
    fail_deregister: AtomicBool,
    stall_register: AtomicBool,
    journal: Mutex<Vec<String>>,
}

impl CountingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let registry = Self::default();
        registry.fail_register.store(true, Ordering::SeqCst);
        Arc::new(registry)
    }

    pub fn registers(&self) -> usize {
        self.registers.load(Ordering::SeqCst)
    }

    pub fn deregisters(&self) -> usize {
        self.deregisters.load(Ordering::SeqCst)
    }

    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deregister(&self, fail: bool) {
        self.fail_deregister.store(fail, Ordering::SeqCst);
    }

    /// 之后的注册调用永不返回
    pub fn set_stall_register(&self, stall: bool) {
        self.stall_register.store(stall, Ordering::SeqCst);
    }

    pub fn record(&self, event: impl Into<String>) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(event.into());
        }
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Registry for CountingRegistry {
    fn name(&self) -> &str {
        "counting"
    }

    async fn register(
        &self,
        descriptor: &ServiceDescriptor,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        if self.stall_register.load(Ordering::SeqCst) {
            self.record("register_stalled");
            return std::future::pending().await;
        }
        if self.fail_register.load(Ordering::SeqCst) {
            self.record("register_failed");
            return Err(RegistryError::Unavailable("registry is down".into()));
        }
        self.record("register");
        self.inner.register(descriptor, ttl).await
    }

    async fn deregister(&self, descriptor: &ServiceDescriptor) -> Result<(), RegistryError> {
        self.deregisters.fetch_add(1, Ordering::SeqCst);
        self.record("deregister");
        if self.fail_deregister.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry is down".into()));
        }
        self.inner.deregister(descriptor).await
    }

    async fn resolve(&self, name: &str) -> Result<Vec<Node>, RegistryError> {
        self.inner.resolve(name).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloResponse {
    pub msg: String,
}

/// `Say.Hello` 处理器，统计调用次数
pub fn greeter(calls: Arc<AtomicUsize>) -> ServiceHandler {
    ServiceHandler::new("Say").endpoint("Hello", move |req: HelloRequest| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(HelloResponse {
                msg: format!("Hello {}", req.name),
            })
        }
    })
}

/// 等待运行时进入指定状态
pub async fn wait_for_state(runtime: &Runtime, state: LeaseState) {
    let mut states = runtime.subscribe();
    tokio::time::timeout(Duration::from_secs(10), states.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for lease state")
        .expect("lease gate closed");
}

/// 测试用 PKI：一个 CA 与一张同时可用于服务端和客户端的证书
pub struct Pki {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl Pki {
    pub fn generate(common_name: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, format!("{} ca", common_name));
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, common_name.to_string());
        leaf_params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        Self {
            ca_pem: ca_cert.pem(),
            cert_pem: leaf.pem(),
            key_pem: leaf_key.serialize_pem(),
        }
    }

    pub fn context(&self, verification: PeerVerification) -> Arc<SecurityContext> {
        let context = SecurityContextBuilder::from_pem(
            self.ca_pem.as_bytes(),
            self.cert_pem.as_bytes(),
            self.key_pem.as_bytes(),
        )
        .unwrap()
        .verification(verification)
        .build()
        .unwrap();
        Arc::new(context)
    }
}
