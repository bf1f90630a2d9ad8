use std::sync::OnceLock;

use anyhow::Context;
use tracing_subscriber::fmt::format::Format;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// 安装全局日志订阅器
///
/// `RUST_LOG` 优先于配置中的级别。重复调用或宿主已安装订阅器时不做任何事。
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).with_context(|| format!("invalid log level: {}", config.level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry
            .with(fmt::layer().event_format(Format::default().compact().with_target(false)))
            .try_init()
    };

    // 宿主已安装订阅器
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed, keeping existing one");
    }
    let _ = INITIALIZED.set(());
    Ok(())
}
