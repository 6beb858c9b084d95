//! 线上帧格式
//!
//! 4 字节大端长度前缀 + JSON 信封。请求与响应通过 `id` 关联，
//! 响应的 `code` 是数值形式的 gRPC 状态码（0 表示成功）。

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tonic::{Code, Status};

use crate::error::TransportError;
use crate::error::status::status_from_wire;

/// 单帧最大长度
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// 请求信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: u64,
    pub service: String,
    pub endpoint: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// 响应信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub id: u64,
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub body: Value,
}

impl Response {
    pub fn ok(id: u64, body: Value) -> Self {
        Self {
            id,
            code: Code::Ok as i32,
            message: String::new(),
            body,
        }
    }

    pub fn error(id: u64, status: &Status) -> Self {
        Self {
            id,
            code: status.code() as i32,
            message: status.message().to_string(),
            body: Value::Null,
        }
    }

    pub fn from_outcome(id: u64, outcome: &Result<Value, Status>) -> Self {
        match outcome {
            Ok(body) => Self::ok(id, body.clone()),
            Err(status) => Self::error(id, status),
        }
    }

    /// 转换为调用结果
    pub fn into_result(self) -> Result<Value, Status> {
        if self.code == Code::Ok as i32 {
            Ok(self.body)
        } else {
            Err(status_from_wire(self.code, self.message))
        }
    }
}

/// 用长度前缀编解码器包装字节流
pub fn framed<S>(stream: S) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, TransportError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T, TransportError> {
    Ok(serde_json::from_slice(frame)?)
}
