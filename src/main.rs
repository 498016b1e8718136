//! Bee Connect 入口：加载配置、初始化日志，组装 Agent、平台与 Engine 并运行到收到关闭信号。
//!
//! 用法：`bee-connect [config/default.toml]`

use std::sync::Arc;

use anyhow::Context;
use bee_connect::agent::{AgentContext, AgentRegistry};
use bee_connect::config::load_config;
use bee_connect::core::ShutdownManager;
use bee_connect::platform::PlatformRegistry;
use bee_connect::session::{SessionFile, SessionRegistry};
use bee_connect::{Engine, EngineSettings};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config_path = std::env::args().nth(1).map(Into::into);
    let cfg = load_config(config_path).context("Failed to load config")?;
    cfg.validate().context("Invalid config")?;

    let work_dir = cfg.app.resolved_work_dir();
    let data_dir = cfg.app.resolved_data_dir();
    tracing::info!(
        project = %cfg.app.project,
        work_dir = %work_dir.display(),
        agent = %cfg.agent.kind,
        "Starting bee-connect"
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let ctx = AgentContext::new(work_dir.clone(), cfg.engine.event_buffer, shutdown.token());
    let agent = AgentRegistry::with_builtin()
        .create(&cfg.agent, ctx)
        .context("Failed to create agent")?;

    let platforms = PlatformRegistry::with_builtin()
        .create_enabled(&cfg.platforms)
        .context("Failed to create platforms")?;
    if platforms.is_empty() {
        tracing::warn!("No platform enabled; enable one under [platforms]");
    }

    let store = SessionFile::for_project(&data_dir, &cfg.app.project, &work_dir);
    let sessions = Arc::new(SessionRegistry::open(store).context("Failed to open session store")?);

    let engine = Engine::new(
        EngineSettings::from_config(&cfg.engine),
        agent,
        platforms,
        sessions,
    );
    engine
        .run(shutdown.token())
        .await
        .context("Engine failed")?;

    Ok(())
}
