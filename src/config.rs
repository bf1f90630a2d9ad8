use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::core::{UploadError, UploadProfile};
use crate::utils::RetryPolicy;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 后端接口配置
#[derive(Deserialize, Debug, Clone)]
pub struct ApiConfig {
    /// API 根地址
    pub base_url: String,
    /// 对象存储公开地址，用于拼接 storageUrl
    pub storage_base_url: String,
    /// 以 X-User-Id 发送
    pub user_id: Option<String>,
    /// 以 Authorization: Bearer 发送
    pub token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 文件传输两次读取之间的最长等待，连接卡住时按网络错误处理
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// 连通性探测地址，未设置则不启动探测
    pub probe_url: Option<String>,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, storage_base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            storage_base_url: storage_base_url.into(),
            user_id: None,
            token: None,
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            probe_url: None,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// 并发 3，逐条确认
    #[default]
    Resilient,
    /// 并发 6
    Throughput,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UploadSettings {
    #[serde(default)]
    pub profile: ProfileKind,
    pub max_concurrent: Option<usize>,
    pub chunk_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub confirm_uploads: Option<bool>,
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            profile: ProfileKind::default(),
            max_concurrent: None,
            chunk_size: None,
            max_retries: None,
            retry_delay_ms: None,
            confirm_uploads: None,
            progress_interval_ms: default_progress_interval(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_request_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

fn default_progress_interval() -> u64 {
    400
}

fn default_probe_interval() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&config_str).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(s).context("failed to parse config")?;
        config.profile().context("invalid upload profile")?;
        Ok(config)
    }

    /// 预设加上覆盖项
    pub fn profile(&self) -> Result<UploadProfile, UploadError> {
        let settings = &self.upload;
        let mut profile = match settings.profile {
            ProfileKind::Resilient => UploadProfile::resilient(),
            ProfileKind::Throughput => UploadProfile::throughput(),
        };

        if let Some(max_concurrent) = settings.max_concurrent {
            profile.max_concurrent = max_concurrent;
        }
        if let Some(chunk_size) = settings.chunk_size {
            profile.chunk_size = chunk_size;
        }
        let mut retry = RetryPolicy::default();
        if let Some(max_retries) = settings.max_retries {
            retry.max_retries = max_retries;
        }
        if let Some(delay) = settings.retry_delay_ms {
            retry.delay = Duration::from_millis(delay);
        }
        profile.retry = retry;
        if let Some(confirm) = settings.confirm_uploads {
            profile.confirm_uploads = confirm;
        }
        profile.progress_interval = Duration::from_millis(settings.progress_interval_ms);

        profile.validate()?;
        Ok(profile)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.upload.probe_interval_secs.max(1))
    }
}
