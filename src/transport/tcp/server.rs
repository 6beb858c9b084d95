//! TCP 服务端

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::Status;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::transport::frame::{self, Request, Response};
use crate::transport::security::SecurityContext;
use crate::transport::{Handler, Interceptor, IoStream, Server};
use crate::types::Endpoint;

/// 默认停止等待时长
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum ServeStatus {
    Idle,
    Serving,
    Stopped,
    Failed(String),
}

struct Serving {
    shutdown: CancellationToken,
    connections: TaskTracker,
    accept_loop: JoinHandle<()>,
}

/// 处理器与拦截器表
#[derive(Default)]
struct Dispatcher {
    handlers: RwLock<BTreeMap<String, Arc<dyn Handler>>>,
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
}

impl Dispatcher {
    async fn route(&self, request: &Request) -> Result<Value, Status> {
        let (handler_name, method) = request
            .endpoint
            .split_once('.')
            .ok_or_else(|| Status::unimplemented(format!("malformed endpoint {}", request.endpoint)))?;

        let handler = self
            .handlers
            .read()
            .await
            .get(handler_name)
            .cloned()
            .ok_or_else(|| Status::unimplemented(format!("unknown handler {}", handler_name)))?;

        handler.call(method, request.body.clone()).await
    }
}

/// TCP 服务端
///
/// `listen()` 只绑定端口，`start()` 才开始接受连接；`stop()` 之后可以再次
/// `listen()` + `start()`。
pub struct TcpServer {
    address: SocketAddr,
    shutdown_timeout: Duration,
    security: Option<Arc<SecurityContext>>,
    dispatcher: Arc<Dispatcher>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    serving: Mutex<Option<Serving>>,
    status: watch::Sender<ServeStatus>,
}

impl TcpServer {
    pub fn new(address: SocketAddr, security: Option<Arc<SecurityContext>>) -> Self {
        let (status, _) = watch::channel(ServeStatus::Idle);
        Self {
            address,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            security,
            dispatcher: Arc::new(Dispatcher::default()),
            listener: Mutex::new(None),
            local_addr: std::sync::Mutex::new(None),
            serving: Mutex::new(None),
            status,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// 最近一次绑定的地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        if let Ok(mut guard) = self.local_addr.lock() {
            *guard = addr;
        }
    }
}

#[async_trait]
impl Server for TcpServer {
    async fn handle(&self, handler: Arc<dyn Handler>) -> Result<(), TransportError> {
        let name = handler.name().to_string();
        debug!(handler = %name, methods = ?handler.methods(), "Handler attached");
        self.dispatcher.handlers.write().await.insert(name, handler);
        Ok(())
    }

    async fn intercept(&self, interceptor: Arc<dyn Interceptor>) {
        self.dispatcher.interceptors.write().await.push(interceptor);
    }

    async fn endpoints(&self) -> Vec<Endpoint> {
        self.dispatcher
            .handlers
            .read()
            .await
            .values()
            .flat_map(|handler| handler.endpoints())
            .collect()
    }

    async fn listen(&self) -> Result<SocketAddr, TransportError> {
        let mut listener = self.listener.lock().await;
        if let Some(bound) = listener.as_ref() {
            return Ok(bound.local_addr()?);
        }

        let bound = TcpListener::bind(self.address).await?;
        let local_addr = bound.local_addr()?;
        *listener = Some(bound);
        self.set_local_addr(Some(local_addr));

        info!(address = %local_addr, tls = self.security.is_some(), "Server listening");
        Ok(local_addr)
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut serving = self.serving.lock().await;
        if serving.is_some() {
            return Err(TransportError::AlreadyServing);
        }
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(TransportError::NotListening)?;

        let shutdown = CancellationToken::new();
        let connections = TaskTracker::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            self.dispatcher.clone(),
            self.security.clone(),
            shutdown.clone(),
            connections.clone(),
            self.status.clone(),
        ));

        self.status.send_replace(ServeStatus::Serving);
        *serving = Some(Serving {
            shutdown,
            connections,
            accept_loop,
        });
        info!(address = ?self.local_addr(), "✅ Server started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        // 未启动但已绑定时，释放端口
        self.listener.lock().await.take();

        let Some(serving) = self.serving.lock().await.take() else {
            self.set_local_addr(None);
            return Ok(());
        };

        serving.shutdown.cancel();
        if let Err(e) = serving.accept_loop.await {
            warn!(error = %e, "Accept loop terminated abnormally");
        }

        serving.connections.close();
        let drained = tokio::time::timeout(self.shutdown_timeout, serving.connections.wait()).await;

        self.status.send_if_modified(|status| {
            if matches!(status, ServeStatus::Failed(_)) {
                false
            } else {
                *status = ServeStatus::Stopped;
                true
            }
        });
        self.set_local_addr(None);

        match drained {
            Ok(()) => {
                info!("Server stopped");
                Ok(())
            }
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "⚠️ In-flight requests did not finish before shutdown timeout");
                Err(TransportError::ShutdownTimeout(self.shutdown_timeout))
            }
        }
    }

    async fn closed(&self) -> Result<(), TransportError> {
        let mut status = self.status.subscribe();
        let outcome = status
            .wait_for(|s| matches!(s, ServeStatus::Stopped | ServeStatus::Failed(_)))
            .await
            .map(|s| s.clone());

        match outcome {
            Ok(ServeStatus::Failed(reason)) => Err(TransportError::Io(io::Error::other(reason))),
            _ => Ok(()),
        }
    }
}

/// 可以跳过的 accept 错误
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    security: Option<Arc<SecurityContext>>,
    shutdown: CancellationToken,
    connections: TaskTracker,
    status: watch::Sender<ServeStatus>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                connections.spawn(serve_connection(
                    stream,
                    peer,
                    dispatcher.clone(),
                    security.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "Transient accept error, skipping");
            }
            Err(e) => {
                error!(error = %e, "❌ Accept loop failed");
                status.send_replace(ServeStatus::Failed(e.to_string()));
                return;
            }
        }
    }
    debug!("Accept loop exited");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    security: Option<Arc<SecurityContext>>,
    shutdown: CancellationToken,
) {
    let io: Box<dyn IoStream> = match security {
        Some(security) => {
            let handshake = tokio::select! {
                _ = shutdown.cancelled() => return,
                handshake = security.acceptor().accept(stream) => handshake,
            };
            match handshake {
                Ok(tls) => Box::new(tls),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "TLS handshake rejected");
                    return;
                }
            }
        }
        None => Box::new(stream),
    };

    let mut framed = frame::framed(io);
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = framed.next() => next,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                debug!(peer = %peer, error = %e, "Connection read failed");
                break;
            }
            None => break,
        };

        let request: Request = match frame::decode(&bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed request frame");
                let response = Response::error(0, &Status::invalid_argument(e.to_string()));
                if let Ok(payload) = frame::encode(&response) {
                    let _ = framed.send(payload).await;
                }
                break;
            }
        };

        let interceptors = dispatcher.interceptors.read().await.clone();

        // 被拒绝时，已放行的拦截器仍会收到 after
        let mut admitted = 0;
        let mut rejection = None;
        for interceptor in &interceptors {
            match interceptor.before(&request).await {
                Ok(()) => admitted += 1,
                Err(status) => {
                    rejection = Some(status);
                    break;
                }
            }
        }

        let outcome = match rejection {
            Some(status) => {
                debug!(
                    peer = %peer,
                    endpoint = %request.endpoint,
                    code = ?status.code(),
                    "Request rejected by interceptor"
                );
                Err(status)
            }
            None => dispatch(&dispatcher, &request, peer).await,
        };
        let sent = send_response(&mut framed, &Response::from_outcome(request.id, &outcome)).await;

        for interceptor in interceptors[..admitted].iter().rev() {
            interceptor.after(&request, &outcome).await;
        }

        if let Err(e) = sent {
            debug!(peer = %peer, error = %e, "Failed to write response");
            break;
        }
    }
}

/// 处理器 panic 转换为 `Internal`，保证响应与 `after` 照常执行
async fn dispatch(dispatcher: &Dispatcher, request: &Request, peer: SocketAddr) -> Result<Value, Status> {
    match AssertUnwindSafe(dispatcher.route(request)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(peer = %peer, endpoint = %request.endpoint, reason = %reason, "❌ Handler panicked");
            Err(Status::internal(format!("handler panicked: {}", reason)))
        }
    }
}

async fn send_response<S>(
    framed: &mut tokio_util::codec::Framed<S, tokio_util::codec::LengthDelimitedCodec>,
    response: &Response,
) -> Result<(), TransportError>
where
    S: IoStream,
{
    framed.send(frame::encode(response)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ServiceHandler;
    use serde_json::json;

    fn server() -> TcpServer {
        TcpServer::new("127.0.0.1:0".parse().unwrap(), None)
    }

    async fn exchange(addr: SocketAddr, request: &Request) -> Response {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = frame::framed(stream);
        framed.send(frame::encode(request).unwrap()).await.unwrap();
        let bytes = framed.next().await.unwrap().unwrap();
        frame::decode(&bytes).unwrap()
    }

    fn request(endpoint: &str, body: Value) -> Request {
        Request {
            id: 1,
            service: "calc".into(),
            endpoint: endpoint.into(),
            headers: Default::default(),
            body,
        }
    }

    #[tokio::test]
    async fn start_requires_listen() {
        assert!(matches!(server().start().await, Err(TransportError::NotListening)));
    }

    #[tokio::test]
    async fn dispatches_and_reports_unknown_endpoints() {
        let server = server();
        let handler = ServiceHandler::new("Calc")
            .endpoint("Double", |n: i64| async move { Ok(n * 2) });
        server.handle(Arc::new(handler)).await.unwrap();
        let addr = server.listen().await.unwrap();
        server.start().await.unwrap();

        let ok = exchange(addr, &request("Calc.Double", json!(21))).await;
        assert_eq!(ok.into_result().unwrap(), json!(42));

        let missing = exchange(addr, &request("Nope.Double", json!(1))).await;
        assert_eq!(missing.into_result().unwrap_err().code(), tonic::Code::Unimplemented);

        let bad = exchange(addr, &request("Calc.Double", json!("x"))).await;
        assert_eq!(bad.into_result().unwrap_err().code(), tonic::Code::InvalidArgument);

        server.stop().await.unwrap();
        server.closed().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_handler_answers_internal() {
        let server = server();
        let handler = ServiceHandler::new("Calc").endpoint("Boom", |_: i64| async move {
            if true {
                panic!("boom");
            }
            Ok(0_i64)
        });
        server.handle(Arc::new(handler)).await.unwrap();
        let addr = server.listen().await.unwrap();
        server.start().await.unwrap();

        let crashed = exchange(addr, &request("Calc.Boom", json!(1))).await;
        let status = crashed.into_result().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("boom"));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restarts_after_stop() {
        let server = server();
        server.listen().await.unwrap();
        server.start().await.unwrap();
        assert!(matches!(server.start().await, Err(TransportError::AlreadyServing)));
        server.stop().await.unwrap();

        let addr = server.listen().await.unwrap();
        server.start().await.unwrap();
        assert!(TcpStream::connect(addr).await.is_ok());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lists_endpoints_of_attached_handlers() {
        let server = server();
        let handler = ServiceHandler::new("Say")
            .endpoint("Hello", |s: String| async move { Ok(s) })
            .endpoint("Bye", |s: String| async move { Ok(s) });
        server.handle(Arc::new(handler)).await.unwrap();

        let endpoints = server.endpoints().await;
        assert_eq!(endpoints, vec![Endpoint::new("Say.Bye"), Endpoint::new("Say.Hello")]);
    }
}
