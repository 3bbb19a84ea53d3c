//! # 配置管理模块
//!
//! 处理应用配置加载、验证和管理

mod app_config;

pub use app_config::{
    AppConfig, IdentityConfig, RedisConfig, ServerConfig, SessionRefreshConfig, StorageConfig,
    UpstreamConfig,
};

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Context, PipError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "PIP_TRACKER_CONFIG_PATH";

/// Config file chosen from the environment.
///
/// `PIP_TRACKER_CONFIG_PATH` wins, otherwise `config/config.{RUST_ENV}.toml`
/// with `RUST_ENV` defaulting to `dev`.
#[must_use]
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    let env = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
    PathBuf::from(format!("config/config.{env}.toml"))
}

/// 加载配置文件
pub fn load_config() -> Result<AppConfig> {
    load_config_from(default_config_path())
}

/// Load and validate the config at `path`.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(PipError::config(format!(
            "config file not found: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;

    linfo!(
        "system",
        LogStage::Configuration,
        LogComponent::Config,
        "config_loaded",
        "configuration loaded",
        path = %path.display(),
        limiters = config.rate_limits.len(),
        upstreams = config.upstreams.len()
    );
    Ok(config)
}

/// Parse and validate TOML configuration text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    config.validate().map_err(PipError::config)?;
    Ok(config)
}
