use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::errors::Result;
use super::progress::ProgressReporter;
use super::registrar::{PhotoEntry, UploadConfirmation};
use super::types::{ContainerId, Destination, UploadId, UploadRecord};

/// 批量获取上传地址
#[async_trait]
pub trait DestinationProvider: Send + Sync {
    /// 一次请求为一批记录获取上传目标，缺失的记录不出现在结果中
    async fn acquire_destinations(&self, records: &[UploadRecord]) -> Result<HashMap<UploadId, Destination>>;
}

/// 单个文件的字节传输
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// 上传记录内容到目标地址
    ///
    /// 进度通过 `progress` 上报；`cancel` 触发后必须尽快返回 `TransferError::Cancelled`。
    async fn transfer(
        &self,
        record: &UploadRecord,
        destination: &Destination,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// 元数据存储
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// 新建容器
    async fn create_container(&self, name: &str) -> Result<ContainerId>;

    /// 批量写入，返回写入条数
    async fn insert_batch(&self, container: ContainerId, entries: &[PhotoEntry]) -> Result<usize>;

    /// 单条写入
    async fn insert_one(&self, container: ContainerId, entry: &PhotoEntry) -> Result<()>;

    /// 确认上传，对同一 storage key 幂等
    async fn confirm_upload(&self, confirmation: &UploadConfirmation) -> Result<()>;
}

/// 连通性探测
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}
