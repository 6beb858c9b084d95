//! 错误与 gRPC 状态码之间的转换
//!
//! 线上信封只携带数值状态码与消息，两端都通过 [`tonic::Code`] 解释。

use super::{RegistryError, TransportError};
use tonic::{Code, Status};

impl From<RegistryError> for Status {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(name) => {
                Status::not_found(format!("service {} not found", name))
            }
            RegistryError::Unavailable(msg) => Status::unavailable(msg),
            RegistryError::Backend(msg) => Status::internal(msg),
            RegistryError::Codec(msg) => Status::internal(msg),
        }
    }
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(e) => Status::unavailable(e.to_string()),
            TransportError::Tls(msg) => Status::unavailable(format!("tls: {}", msg)),
            TransportError::Codec(msg) => Status::internal(msg),
            other => Status::unavailable(other.to_string()),
        }
    }
}

/// 把线上的数值状态码还原为 `Status`
pub fn status_from_wire(code: i32, message: impl Into<String>) -> Status {
    Status::new(Code::from_i32(code), message)
}

/// 状态码是否值得换节点重试（只有连接层面的不可用）
pub fn is_retryable(status: &Status) -> bool {
    status.code() == Code::Unavailable
}
