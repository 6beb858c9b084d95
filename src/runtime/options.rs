//! 运行时选项
//!
//! 选项是一个有序列表，按从左到右折叠进不可变的 [`Options`]；
//! 同一个 [`OptionKey`] 以最后写入者为准。

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};
use crate::registry::{MemoryRegistry, Registry};
use crate::retry::ExponentialBackoffPolicy;
use crate::transport::tcp::TcpTransport;
use crate::transport::{Client, SecurityContext, Server, TransportBinding};

/// 未设置服务名时使用的默认值
pub const DEFAULT_SERVICE_NAME: &str = "flare.micro.service";

/// 默认监听地址（随机端口）
pub const DEFAULT_ADDRESS: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

/// 默认停止等待时长
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Function 模式默认 TTL
pub const FUNCTION_REGISTER_TTL: Duration = Duration::from_secs(60);

/// Function 模式默认续期间隔
pub const FUNCTION_REGISTER_INTERVAL: Duration = Duration::from_secs(30);

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// 常驻服务，持续续期直到关闭
    #[default]
    Service,
    /// 单次调用，服务一次请求后注销退出
    Function,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Service => f.write_str("service"),
            Mode::Function => f.write_str("function"),
        }
    }
}

/// 生命周期钩子
pub type Hook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// 选项键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    Name,
    Version,
    Address,
    Metadata,
    Mode,
    Registry,
    Client,
    Server,
    Transport,
    Security,
    RegisterTtl,
    RegisterInterval,
    RegisterBackoff,
    Context,
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
    HandleSignal,
    ShutdownTimeout,
}

/// 单个选项
#[derive(Clone)]
pub enum RuntimeOption {
    Name(String),
    Version(String),
    Address(SocketAddr),
    Metadata(HashMap<String, String>),
    Mode(Mode),
    Registry(Arc<dyn Registry>),
    Client(Arc<dyn Client>),
    Server(Arc<dyn Server>),
    Transport(Arc<dyn TransportBinding>),
    Security(Arc<SecurityContext>),
    RegisterTtl(Duration),
    RegisterInterval(Duration),
    RegisterBackoff(ExponentialBackoffPolicy),
    Context(CancellationToken),
    BeforeStart(Hook),
    AfterStart(Hook),
    BeforeStop(Hook),
    AfterStop(Hook),
    HandleSignal(bool),
    ShutdownTimeout(Duration),
}

impl RuntimeOption {
    pub fn key(&self) -> OptionKey {
        match self {
            RuntimeOption::Name(_) => OptionKey::Name,
            RuntimeOption::Version(_) => OptionKey::Version,
            RuntimeOption::Address(_) => OptionKey::Address,
            RuntimeOption::Metadata(_) => OptionKey::Metadata,
            RuntimeOption::Mode(_) => OptionKey::Mode,
            RuntimeOption::Registry(_) => OptionKey::Registry,
            RuntimeOption::Client(_) => OptionKey::Client,
            RuntimeOption::Server(_) => OptionKey::Server,
            RuntimeOption::Transport(_) => OptionKey::Transport,
            RuntimeOption::Security(_) => OptionKey::Security,
            RuntimeOption::RegisterTtl(_) => OptionKey::RegisterTtl,
            RuntimeOption::RegisterInterval(_) => OptionKey::RegisterInterval,
            RuntimeOption::RegisterBackoff(_) => OptionKey::RegisterBackoff,
            RuntimeOption::Context(_) => OptionKey::Context,
            RuntimeOption::BeforeStart(_) => OptionKey::BeforeStart,
            RuntimeOption::AfterStart(_) => OptionKey::AfterStart,
            RuntimeOption::BeforeStop(_) => OptionKey::BeforeStop,
            RuntimeOption::AfterStop(_) => OptionKey::AfterStop,
            RuntimeOption::HandleSignal(_) => OptionKey::HandleSignal,
            RuntimeOption::ShutdownTimeout(_) => OptionKey::ShutdownTimeout,
        }
    }
}

impl fmt::Debug for RuntimeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeOption::Name(name) => write!(f, "Name({:?})", name),
            RuntimeOption::Version(version) => write!(f, "Version({:?})", version),
            RuntimeOption::Address(address) => write!(f, "Address({})", address),
            RuntimeOption::Metadata(metadata) => write!(f, "Metadata({:?})", metadata),
            RuntimeOption::Mode(mode) => write!(f, "Mode({})", mode),
            RuntimeOption::Registry(registry) => write!(f, "Registry({})", registry.name()),
            RuntimeOption::Transport(transport) => write!(f, "Transport({})", transport.name()),
            RuntimeOption::Security(security) => write!(f, "Security({:?})", security.verification()),
            RuntimeOption::RegisterTtl(ttl) => write!(f, "RegisterTtl({:?})", ttl),
            RuntimeOption::RegisterInterval(interval) => write!(f, "RegisterInterval({:?})", interval),
            RuntimeOption::RegisterBackoff(backoff) => write!(f, "RegisterBackoff({:?})", backoff),
            RuntimeOption::HandleSignal(enabled) => write!(f, "HandleSignal({})", enabled),
            RuntimeOption::ShutdownTimeout(timeout) => write!(f, "ShutdownTimeout({:?})", timeout),
            other => write!(f, "{:?}", other.key()),
        }
    }
}

// ---- 选项构造函数 ----

pub fn name(name: impl Into<String>) -> RuntimeOption {
    RuntimeOption::Name(name.into())
}

pub fn version(version: impl Into<String>) -> RuntimeOption {
    RuntimeOption::Version(version.into())
}

pub fn address(address: SocketAddr) -> RuntimeOption {
    RuntimeOption::Address(address)
}

pub fn metadata<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> RuntimeOption
where
    K: Into<String>,
    V: Into<String>,
{
    RuntimeOption::Metadata(entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
}

pub fn mode(mode: Mode) -> RuntimeOption {
    RuntimeOption::Mode(mode)
}

pub fn registry(registry: Arc<dyn Registry>) -> RuntimeOption {
    RuntimeOption::Registry(registry)
}

pub fn client(client: Arc<dyn Client>) -> RuntimeOption {
    RuntimeOption::Client(client)
}

pub fn server(server: Arc<dyn Server>) -> RuntimeOption {
    RuntimeOption::Server(server)
}

pub fn transport(transport: Arc<dyn TransportBinding>) -> RuntimeOption {
    RuntimeOption::Transport(transport)
}

pub fn security(context: Arc<SecurityContext>) -> RuntimeOption {
    RuntimeOption::Security(context)
}

pub fn register_ttl(ttl: Duration) -> RuntimeOption {
    RuntimeOption::RegisterTtl(ttl)
}

pub fn register_interval(interval: Duration) -> RuntimeOption {
    RuntimeOption::RegisterInterval(interval)
}

/// 首次注册失败后的退避（基准时长翻倍，封顶 `max`）
pub fn register_backoff(base: Duration, max: Duration) -> RuntimeOption {
    RuntimeOption::RegisterBackoff(ExponentialBackoffPolicy::unbounded(base, max).with_jitter(true))
}

/// 取消作用域：token 被取消即触发注销并退出 `run()`
pub fn context(token: CancellationToken) -> RuntimeOption {
    RuntimeOption::Context(token)
}

pub fn before_start<F, Fut>(f: F) -> RuntimeOption
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    RuntimeOption::BeforeStart(hook(f))
}

pub fn after_start<F, Fut>(f: F) -> RuntimeOption
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    RuntimeOption::AfterStart(hook(f))
}

pub fn before_stop<F, Fut>(f: F) -> RuntimeOption
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    RuntimeOption::BeforeStop(hook(f))
}

pub fn after_stop<F, Fut>(f: F) -> RuntimeOption
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    RuntimeOption::AfterStop(hook(f))
}

/// 是否把 SIGINT / SIGTERM 当作取消
pub fn handle_signal(enabled: bool) -> RuntimeOption {
    RuntimeOption::HandleSignal(enabled)
}

pub fn shutdown_timeout(timeout: Duration) -> RuntimeOption {
    RuntimeOption::ShutdownTimeout(timeout)
}

/// 有序选项列表
#[derive(Clone, Debug, Default)]
pub struct OptionSet {
    options: Vec<RuntimeOption>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个选项（链式）
    pub fn with(mut self, option: RuntimeOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn push(&mut self, option: RuntimeOption) {
        self.options.push(option);
    }

    /// 把另一层选项追加在后面（后者覆盖前者）
    pub fn merge(mut self, other: OptionSet) -> Self {
        self.options.extend(other.options);
        self
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuntimeOption> {
        self.options.iter()
    }

    /// 某个键最终生效的值
    pub fn last(&self, key: OptionKey) -> Option<&RuntimeOption> {
        self.options.iter().rev().find(|option| option.key() == key)
    }

    /// 从左到右折叠到 `base` 上
    pub fn fold(&self, base: Options) -> Options {
        self.options.iter().cloned().fold(base, Options::apply)
    }
}

impl FromIterator<RuntimeOption> for OptionSet {
    fn from_iter<I: IntoIterator<Item = RuntimeOption>>(iter: I) -> Self {
        Self {
            options: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<RuntimeOption>> for OptionSet {
    fn from(options: Vec<RuntimeOption>) -> Self {
        Self { options }
    }
}

/// 生命周期钩子集合
#[derive(Clone, Default)]
pub struct Hooks {
    pub before_start: Option<Hook>,
    pub after_start: Option<Hook>,
    pub before_stop: Option<Hook>,
    pub after_stop: Option<Hook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_start", &self.before_start.is_some())
            .field("after_start", &self.after_start.is_some())
            .field("before_stop", &self.before_stop.is_some())
            .field("after_stop", &self.after_stop.is_some())
            .finish()
    }
}

/// 折叠后的不可变配置
#[derive(Clone)]
pub struct Options {
    pub name: String,
    pub version: String,
    pub address: SocketAddr,
    pub metadata: HashMap<String, String>,
    pub mode: Mode,
    pub registry: Arc<dyn Registry>,
    pub client: Option<Arc<dyn Client>>,
    pub server: Option<Arc<dyn Server>>,
    pub transport: Arc<dyn TransportBinding>,
    pub security: Option<Arc<SecurityContext>>,
    pub register_ttl: Option<Duration>,
    pub register_interval: Option<Duration>,
    pub register_backoff: ExponentialBackoffPolicy,
    pub context: CancellationToken,
    pub hooks: Hooks,
    pub handle_signal: bool,
    pub shutdown_timeout: Duration,
}

impl Options {
    /// 框架级默认值
    pub fn framework_defaults() -> Self {
        Self {
            name: DEFAULT_SERVICE_NAME.to_string(),
            version: String::new(),
            address: DEFAULT_ADDRESS,
            metadata: HashMap::new(),
            mode: Mode::Service,
            registry: Arc::new(MemoryRegistry::new()),
            client: None,
            server: None,
            transport: Arc::new(TcpTransport::new()),
            security: None,
            register_ttl: None,
            register_interval: None,
            register_backoff: ExponentialBackoffPolicy::default().with_jitter(true),
            context: CancellationToken::new(),
            hooks: Hooks::default(),
            handle_signal: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    fn apply(mut self, option: RuntimeOption) -> Self {
        match option {
            RuntimeOption::Name(name) => self.name = name,
            RuntimeOption::Version(version) => self.version = version,
            RuntimeOption::Address(address) => self.address = address,
            RuntimeOption::Metadata(metadata) => self.metadata = metadata,
            RuntimeOption::Mode(mode) => self.mode = mode,
            RuntimeOption::Registry(registry) => self.registry = registry,
            RuntimeOption::Client(client) => self.client = Some(client),
            RuntimeOption::Server(server) => self.server = Some(server),
            RuntimeOption::Transport(transport) => self.transport = transport,
            RuntimeOption::Security(security) => self.security = Some(security),
            RuntimeOption::RegisterTtl(ttl) => self.register_ttl = Some(ttl),
            RuntimeOption::RegisterInterval(interval) => self.register_interval = Some(interval),
            RuntimeOption::RegisterBackoff(backoff) => self.register_backoff = backoff,
            RuntimeOption::Context(token) => self.context = token,
            RuntimeOption::BeforeStart(hook) => self.hooks.before_start = Some(hook),
            RuntimeOption::AfterStart(hook) => self.hooks.after_start = Some(hook),
            RuntimeOption::BeforeStop(hook) => self.hooks.before_stop = Some(hook),
            RuntimeOption::AfterStop(hook) => self.hooks.after_stop = Some(hook),
            RuntimeOption::HandleSignal(enabled) => self.handle_signal = enabled,
            RuntimeOption::ShutdownTimeout(timeout) => self.shutdown_timeout = timeout,
        }
        self
    }

    /// 校验选项组合
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RuntimeError::config("service name must not be empty"));
        }
        if self.register_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(RuntimeError::config("register ttl must be greater than zero"));
        }
        if self.register_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(RuntimeError::config("register interval must be greater than zero"));
        }
        if let (Some(ttl), Some(interval)) = (self.register_ttl, self.register_interval) {
            if interval >= ttl {
                return Err(RuntimeError::config(format!(
                    "register interval {:?} must be shorter than ttl {:?}",
                    interval, ttl
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("address", &self.address)
            .field("mode", &self.mode)
            .field("registry", &self.registry.name())
            .field("transport", &self.transport.name())
            .field("secure", &self.security.is_some())
            .field("register_ttl", &self.register_ttl)
            .field("register_interval", &self.register_interval)
            .field("hooks", &self.hooks)
            .field("handle_signal", &self.handle_signal)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}
