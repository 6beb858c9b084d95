//! 传输安全上下文
//!
//! 一份 [`SecurityContext`] 同时生成服务端与客户端的 rustls 配置，
//! 由 TransportBinding 以 `Arc` 共享给 Client 与 Server，两端不会出现策略分歧。
//! 构建完成后只读，无需同步。

use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// 对端校验策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerVerification {
    /// 双向校验：服务端要求客户端出示由同一 CA 签发的证书
    #[default]
    Mutual,
    /// 仅客户端校验服务端证书
    ServerOnly,
}

/// 安全上下文错误
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("failed to read pem material: {0}")]
    Pem(String),

    #[error("no trusted ca certificates configured")]
    NoTrustAnchors,

    #[error("no certificate identity configured")]
    MissingIdentity,

    #[error("invalid server name `{0}`")]
    InvalidServerName(String),

    #[error("client verifier: {0}")]
    Verifier(String),

    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

/// 传输安全上下文
#[derive(Clone)]
pub struct SecurityContext {
    verification: PeerVerification,
    server_name: Option<String>,
    server_config: Arc<ServerConfig>,
    client_config: Arc<ClientConfig>,
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("verification", &self.verification)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl SecurityContext {
    pub fn builder() -> SecurityContextBuilder {
        SecurityContextBuilder::default()
    }

    pub fn verification(&self) -> PeerVerification {
        self.verification
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    /// 客户端握手使用的服务端名称：优先使用配置值，否则使用节点地址
    pub fn server_name_for(&self, host: &str) -> Result<ServerName<'static>, SecurityError> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name)
            .map(|server_name| server_name.to_owned())
            .map_err(|_| SecurityError::InvalidServerName(name.to_string()))
    }
}

/// 安全上下文构建器
#[derive(Default)]
pub struct SecurityContextBuilder {
    ca_certificates: Vec<CertificateDer<'static>>,
    certificate_chain: Vec<CertificateDer<'static>>,
    private_key: Option<PrivateKeyDer<'static>>,
    verification: PeerVerification,
    server_name: Option<String>,
}

impl SecurityContextBuilder {
    /// 从 PEM 内容加载 CA、证书链与私钥
    pub fn from_pem(ca: &[u8], cert: &[u8], key: &[u8]) -> Result<Self, SecurityError> {
        let ca_certificates = CertificateDer::pem_slice_iter(ca)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SecurityError::Pem(e.to_string()))?;
        let certificate_chain = CertificateDer::pem_slice_iter(cert)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SecurityError::Pem(e.to_string()))?;
        let private_key =
            PrivateKeyDer::from_pem_slice(key).map_err(|e| SecurityError::Pem(e.to_string()))?;

        Ok(Self::default()
            .ca_certificates(ca_certificates)
            .identity(certificate_chain, private_key))
    }

    /// 从 PEM 文件加载
    pub fn from_pem_files(
        ca: impl AsRef<Path>,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<Self, SecurityError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| SecurityError::Pem(format!("{}: {}", path.display(), e)))
        };
        Self::from_pem(&read(ca.as_ref())?, &read(cert.as_ref())?, &read(key.as_ref())?)
    }

    pub fn ca_certificates(mut self, certs: impl IntoIterator<Item = CertificateDer<'static>>) -> Self {
        self.ca_certificates.extend(certs);
        self
    }

    pub fn identity(mut self, chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        self.certificate_chain = chain;
        self.private_key = Some(key);
        self
    }

    pub fn verification(mut self, verification: PeerVerification) -> Self {
        self.verification = verification;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<SecurityContext, SecurityError> {
        if self.ca_certificates.is_empty() {
            return Err(SecurityError::NoTrustAnchors);
        }
        let key = self.private_key.ok_or(SecurityError::MissingIdentity)?;
        if self.certificate_chain.is_empty() {
            return Err(SecurityError::MissingIdentity);
        }

        let mut roots = RootCertStore::empty();
        for cert in self.ca_certificates {
            roots.add(cert)?;
        }
        let roots = Arc::new(roots);
        let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());

        let server_builder =
            ServerConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;
        let server_config = match self.verification {
            PeerVerification::Mutual => {
                let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
                    .build()
                    .map_err(|e| SecurityError::Verifier(e.to_string()))?;
                server_builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(self.certificate_chain.clone(), key.clone_key())?
            }
            PeerVerification::ServerOnly => server_builder
                .with_no_client_auth()
                .with_single_cert(self.certificate_chain.clone(), key.clone_key())?,
        };

        let client_builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);
        let client_config = match self.verification {
            PeerVerification::Mutual => {
                client_builder.with_client_auth_cert(self.certificate_chain, key)?
            }
            PeerVerification::ServerOnly => client_builder.with_no_client_auth(),
        };

        Ok(SecurityContext {
            verification: self.verification,
            server_name: self.server_name,
            server_config: Arc::new(server_config),
            client_config: Arc::new(client_config),
        })
    }
}
