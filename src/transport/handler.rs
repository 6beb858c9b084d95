//! 请求处理器
//!
//! 端点全名形如 `<Handler>.<Method>`。[`ServiceHandler`] 把带类型的异步闭包
//! 擦除为 JSON 进、JSON 出的方法表，挂载到 Server 后由分发器按名称路由。

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tonic::Status;

use crate::types::Endpoint;

/// 处理器 trait
#[async_trait]
pub trait Handler: Send + Sync {
    /// 处理器名称（端点前缀）
    fn name(&self) -> &str;

    /// 方法名列表
    fn methods(&self) -> Vec<String>;

    /// 调用方法
    async fn call(&self, method: &str, body: Value) -> Result<Value, Status>;

    /// 端点签名（`<name>.<method>`）
    fn endpoints(&self) -> Vec<Endpoint> {
        self.methods()
            .into_iter()
            .map(|method| Endpoint::new(format!("{}.{}", self.name(), method)))
            .collect()
    }
}

type MethodFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, Status>> + Send + Sync>;

/// 基于闭包的处理器
///
/// ```rust,no_run
/// use flare_micro::transport::ServiceHandler;
/// # #[derive(serde::Deserialize)] struct HelloRequest { name: String }
/// # #[derive(serde::Serialize)] struct HelloResponse { msg: String }
///
/// let handler = ServiceHandler::new("Say").endpoint("Hello", |req: HelloRequest| async move {
///     Ok(HelloResponse { msg: format!("Hello {}", req.name) })
/// });
/// ```
#[derive(Clone)]
pub struct ServiceHandler {
    name: String,
    methods: BTreeMap<String, MethodFn>,
}

impl ServiceHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    /// 注册方法
    pub fn endpoint<Req, Resp, F, Fut>(mut self, method: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let f = Arc::new(f);
        let method_fn: MethodFn = Arc::new(move |body: Value| {
            let f = f.clone();
            Box::pin(async move {
                let request: Req = serde_json::from_value(body)
                    .map_err(|e| Status::invalid_argument(format!("invalid request body: {}", e)))?;
                let response = f(request).await?;
                serde_json::to_value(response)
                    .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))
            })
        });
        self.methods.insert(method.into(), method_fn);
        self
    }
}

#[async_trait]
impl Handler for ServiceHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn methods(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, Status> {
        let method_fn = self.methods.get(method).ok_or_else(|| {
            Status::unimplemented(format!("unknown endpoint {}.{}", self.name, method))
        })?;
        method_fn(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn calculator() -> ServiceHandler {
        ServiceHandler::new("Calc").endpoint("Add", |req: Add| async move { Ok(req.a + req.b) })
    }

    #[tokio::test]
    async fn typed_endpoint_decodes_and_encodes() {
        let out = calculator().call("Add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn bad_body_is_invalid_argument() {
        let err = calculator().call("Add", json!({"a": "two"})).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let err = calculator().call("Sub", json!({})).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);
    }

    #[test]
    fn endpoints_are_qualified_by_handler_name() {
        let endpoints = calculator().endpoints();
        assert_eq!(endpoints, vec![Endpoint::new("Calc.Add")]);
    }
}
