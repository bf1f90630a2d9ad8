use std::io::ErrorKind;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误分类，决定是否重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// 连接失败、超时、5xx 等临时错误
    Network,
    /// 服务端拒绝（4xx）或本地文件错误，重试无意义
    Rejected,
    /// 用户或系统取消
    Cancelled,
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error {0}")]
    Http(#[from] reqwest::Error),

    #[error("Network error {0}")]
    Network(String),

    #[error("Server error: status code {status_code}, message: {message}")]
    ServerError {
        status_code: u16,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid url: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Network is offline")]
    Offline,

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransferError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Cancelled => ErrorClass::Cancelled,
            TransferError::Network(_) | TransferError::Offline => ErrorClass::Network,
            TransferError::ServerError { status_code, .. } => classify_status(*status_code),
            TransferError::Http(err) => {
                if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
                    ErrorClass::Network
                } else if let Some(status) = err.status() {
                    classify_status(status.as_u16())
                } else if err.is_decode() || err.is_builder() {
                    ErrorClass::Rejected
                } else {
                    ErrorClass::Network
                }
            }
            TransferError::Io(err) => match err.kind() {
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::ConnectionRefused
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::UnexpectedEof
                | ErrorKind::Interrupted => ErrorClass::Network,
                _ => ErrorClass::Rejected,
            },
            TransferError::InvalidResponse(_)
            | TransferError::InvalidHeaderValue(_)
            | TransferError::UrlParse(_)
            | TransferError::Internal(_) => ErrorClass::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Network
    }
}

/// 408/429 和 5xx 视为临时错误，其余状态码视为拒绝
pub fn classify_status(status_code: u16) -> ErrorClass {
    match status_code {
        408 | 429 => ErrorClass::Network,
        500..=599 => ErrorClass::Network,
        _ => ErrorClass::Rejected,
    }
}

/// 整个上传流程级别的错误
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(#[source] TransferError),

    #[error("An upload pass is already running")]
    AlreadyRunning,

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Missing component: {0}")]
    MissingComponent(&'static str),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Error alias
pub type Result<T, E = TransferError> = std::result::Result<T, E>;
