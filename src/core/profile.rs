use std::time::Duration;

use super::errors::UploadError;
use super::progress::ProgressAggregator;
use crate::utils::RetryPolicy;

/// 编排参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProfile {
    /// 同时上传的文件数
    pub max_concurrent: usize,
    /// 每次申请上传地址的文件数
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    /// 聚合进度刷新间隔
    pub progress_interval: Duration,
    /// 注册前逐条确认上传
    pub confirm_uploads: bool,
}

impl Default for UploadProfile {
    fn default() -> Self {
        Self::resilient()
    }
}

impl UploadProfile {
    pub const DEFAULT_CHUNK_SIZE: usize = 20;

    /// 弱网环境（相机直传）
    pub fn resilient() -> Self {
        Self {
            max_concurrent: 3,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            progress_interval: ProgressAggregator::DEFAULT_INTERVAL,
            confirm_uploads: true,
        }
    }

    /// 快速批量上传
    pub fn throughput() -> Self {
        Self {
            max_concurrent: 6,
            confirm_uploads: false,
            ..Self::resilient()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        if self.max_concurrent == 0 {
            return Err(UploadError::InvalidProfile("max_concurrent must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidProfile("chunk_size must be at least 1".into()));
        }
        Ok(())
    }
}
