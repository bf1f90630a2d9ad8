use std::collections::HashSet;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{ErrorClass, Result, UploadError};

/// 上传记录唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// 由文件名、大小和修改时间派生，同一文件重复选择得到同一个 ID
    pub fn derive(name: &str, size: u64, modified: DateTime<Utc>) -> Self {
        let seed = format!("{}:{}:{}", name, size, modified.timestamp_millis());
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()))
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 上传状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 等待重试
    Retrying,
    /// 已完成
    Success,
    /// 失败
    Error,
    /// 用户未选中，跳过
    Skipped,
    /// 已取消
    Cancelled,
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Retrying => "retrying",
            UploadStatus::Success => "success",
            UploadStatus::Error => "error",
            UploadStatus::Skipped => "skipped",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// 文件内容来源
#[derive(Debug, Clone)]
pub enum ByteSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// 原始文件句柄
#[derive(Debug, Clone)]
pub struct FileHandle {
    /// 原始文件名
    pub name: String,
    /// 文件大小（字节）
    pub size: u64,
    /// MIME 类型
    pub content_type: String,
    /// 最后修改时间
    pub modified: DateTime<Utc>,
    /// 内容来源
    pub source: ByteSource,
}

impl FileHandle {
    /// 从磁盘文件构造，按扩展名推断 MIME 类型
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Self {
            content_type: guess_content_type(&name),
            name,
            size: metadata.len(),
            modified,
            source: ByteSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, modified: DateTime<Utc>, data: Bytes) -> Self {
        let name = name.into();
        Self {
            content_type: guess_content_type(&name),
            size: data.len() as u64,
            name,
            modified,
            source: ByteSource::Memory(data),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

pub fn guess_content_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// 预签名上传目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub url: String,
    pub storage_key: String,
}

/// 单个文件的上传记录
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub id: UploadId,
    pub source: FileHandle,
    pub status: UploadStatus,
    /// 0..=100，上传中单调递增
    pub progress_percent: f64,
    pub retry_count: u32,
    /// 仅在 Error 状态下设置
    pub error_message: Option<String>,
    pub error_class: Option<ErrorClass>,
    /// 一旦设置不再改变
    pub destination: Option<Destination>,
    /// 拍摄时间，EXIF 缺失时退回到文件修改时间
    pub capture_time: DateTime<Utc>,
    /// 最近一次瞬时速度（字节/秒）
    pub transfer_speed: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    pub fn new(source: FileHandle, capture_time: DateTime<Utc>) -> Self {
        Self {
            id: UploadId::derive(&source.name, source.size, source.modified),
            source,
            status: UploadStatus::Pending,
            progress_percent: 0.0,
            retry_count: 0,
            error_message: None,
            error_class: None,
            destination: None,
            capture_time,
            transfer_speed: 0.0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn size(&self) -> u64 {
        self.source.size
    }

    pub fn storage_key(&self) -> Option<&str> {
        self.destination.as_ref().map(|d| d.storage_key.as_str())
    }
}

/// 容器（相册/文件夹）标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub i64);

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 批次的注册目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ContainerTarget {
    /// 新建容器
    New { name: String },
    /// 已有容器
    Existing { id: ContainerId },
}

/// 同一目标容器下的一批文件
#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub records: Vec<UploadRecord>,
    pub target: ContainerTarget,
    /// 加载时直接标记为 Skipped 的记录
    pub deselected: HashSet<UploadId>,
}

impl UploadBatch {
    pub fn new(records: Vec<UploadRecord>, target: ContainerTarget) -> Self {
        Self {
            records,
            target,
            deselected: HashSet::new(),
        }
    }

    pub fn deselect(mut self, id: UploadId) -> Self {
        self.deselected.insert(id);
        self
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        match &self.target {
            ContainerTarget::New { name } if name.trim().is_empty() => {
                Err(UploadError::InvalidBatch("container name is empty".into()))
            }
            ContainerTarget::Existing { id } if id.0 <= 0 => {
                Err(UploadError::InvalidBatch(format!("invalid container id {}", id)))
            }
            _ => Ok(()),
        }
    }
}

/// 聚合进度，只在运行期间存在
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSession {
    pub started_at: DateTime<Utc>,
    pub total_files: usize,
    pub completed_files: usize,
    pub failed_files: usize,
    pub cancelled_files: usize,
    /// 第一个文件完成之前为 None
    pub estimated_seconds_remaining: Option<u64>,
    /// 字节/秒
    pub average_throughput: f64,
}

impl UploadSession {
    pub fn new(started_at: DateTime<Utc>, total_files: usize) -> Self {
        Self {
            started_at,
            total_files,
            completed_files: 0,
            failed_files: 0,
            cancelled_files: 0,
            estimated_seconds_remaining: None,
            average_throughput: 0.0,
        }
    }
}

/// 各状态计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub uploading: usize,
    pub retrying: usize,
    pub success: usize,
    pub error: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: UploadStatus) {
        match status {
            UploadStatus::Pending => self.pending += 1,
            UploadStatus::Uploading => self.uploading += 1,
            UploadStatus::Retrying => self.retrying += 1,
            UploadStatus::Success => self.success += 1,
            UploadStatus::Error => self.error += 1,
            UploadStatus::Skipped => self.skipped += 1,
            UploadStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.uploading
            + self.retrying
            + self.success
            + self.error
            + self.skipped
            + self.cancelled
    }
}

/// 批量注册结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub container: ContainerId,
    pub inserted: usize,
    /// 批量写入失败后是否退回逐条写入
    pub fallback_used: bool,
    pub failed_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    NotAttempted,
    Committed(CommitReport),
    Failed(String),
}

/// 一次上传过程的最终结果
#[derive(Debug, Clone)]
pub struct UploadResults {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    /// 未能获取上传地址而留在 Pending 的记录
    pub pending: usize,
    pub storage_keys: Vec<String>,
    pub registration: RegistrationOutcome,
}

/// 上传事件
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// 状态变更
    StateChanged {
        upload_id: UploadId,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },
    /// 某个分片获取上传地址失败
    ChunkFailed {
        chunk: usize,
        error: String,
    },
    /// 批量注册完成
    Registered(CommitReport),
}

// 静态断言确保类型是 Send的
const _: () = {
    fn assert_send<T: Send + Sync>() {}
    fn assert_types() {
        assert_send::<UploadRecord>();
        assert_send::<UploadEvent>();
        assert_send::<UploadSession>();
    }
};
