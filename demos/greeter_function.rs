//! Function 模式示例：注册、服务一次 `Say.Hello` 调用后注销退出
//!
//! ```bash
//! cargo run --example greeter_function
//! ```
//!
//! 可选：`GREETER_CONFIG=greeter.toml` 从 TOML 文件加载服务配置。

use flare_micro::runtime::{OptionSet, new_function, options};
use flare_micro::{Config, ServiceHandler, TelemetryConfig, init_tracing};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Debug, Serialize)]
struct HelloResponse {
    msg: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(TelemetryConfig::default())?;

    let mut layer = OptionSet::new().with(options::name("greeter"));
    if let Ok(path) = std::env::var("GREETER_CONFIG") {
        layer = layer.merge(Config::load_from_file(&path)?.into_options()?);
    }

    let function = new_function(layer)?;
    function
        .handle(Arc::new(ServiceHandler::new("Say").endpoint(
            "Hello",
            |req: HelloRequest| async move {
                info!(name = %req.name, "Received greeting request");
                Ok(HelloResponse {
                    msg: format!("Hello {}", req.name),
                })
            },
        )))
        .await?;

    function.run().await?;
    info!("✅ Greeter function finished");
    Ok(())
}
