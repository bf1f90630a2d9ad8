use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{ErrorClass, TransferError};

/// 重试配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数
    pub max_retries: u32,
    /// 固定延迟，不做指数增长
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// 重试判断结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待后重试
    Retry(Duration),
    /// 不再重试，记录进入 Error
    GiveUp,
    /// 取消，记录进入 Cancelled
    Cancel,
}

/// 根据错误分类和已重试次数决定下一步
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    /// `attempt` 为已经重试过的次数
    pub fn should_retry(&self, error: &TransferError, attempt: u32) -> RetryDecision {
        match error.class() {
            ErrorClass::Cancelled => RetryDecision::Cancel,
            ErrorClass::Rejected => RetryDecision::GiveUp,
            ErrorClass::Network if attempt < self.policy.max_retries => RetryDecision::Retry(self.policy.delay),
            ErrorClass::Network => RetryDecision::GiveUp,
        }
    }
}
