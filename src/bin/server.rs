//! 三路由演示HTTP服务
//!
//! - `GET /`        立刻响应，accept线程不被占用
//! - `GET /block`   在Event Loop线程上同步计数再响应，期间所有连接都被拖住
//! - `GET /offload` 把计数丢给一个一次性`Worker`线程，循环继续服务其他连接
//!
//! 环境变量：`LISTEN_ADDR`（默认127.0.0.1:3000）、`BLOCK_ITERS`（默认4亿）。

use mini_event_loop::executor::Executor;
use mini_event_loop::http::{Server, DEFAULT_BLOCK_ITERS};
use mini_event_loop::tcp::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let block_iters = std::env::var("BLOCK_ITERS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_BLOCK_ITERS);

    let ex = Executor::new();
    ex.block_on(|| {
        let addr = addr.clone();
        async move {
            let listener = TcpListener::bind(&addr)?;
            info!(%addr, block_iters, "listening");
            println!("try, in separate terminals:");
            println!("  curl http://{}/", addr);
            println!("  curl http://{}/block    # stalls every other request", addr);
            println!("  curl http://{}/offload  # loop stays responsive", addr);
            Server::with_block_iters(block_iters).serve(listener).await?;
            Ok::<_, anyhow::Error>(())
        }
    })
}
