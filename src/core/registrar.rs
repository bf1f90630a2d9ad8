use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::errors::Result;
use super::traits::RegistryBackend;
use super::types::{CommitReport, ContainerTarget, UploadRecord};

/// 写入容器的一条照片元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoEntry {
    pub file_name: String,
    pub storage_url: String,
    pub file_size: u64,
    pub content_type: String,
}

/// 上传确认
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfirmation {
    pub storage_key: String,
    pub original_filename: String,
    pub size_bytes: u64,
    pub content_type: String,
}

impl UploadConfirmation {
    pub fn from_record(record: &UploadRecord) -> Option<Self> {
        Some(Self {
            storage_key: record.storage_key()?.to_string(),
            original_filename: record.source.name.clone(),
            size_bytes: record.source.size,
            content_type: record.source.content_type.clone(),
        })
    }
}

/// 上传完成后把元数据批量写入容器
#[derive(Clone)]
pub struct BatchRegistrar {
    backend: Arc<dyn RegistryBackend>,
    storage_base_url: String,
    confirm_uploads: bool,
}

impl BatchRegistrar {
    pub fn new(backend: Arc<dyn RegistryBackend>, storage_base_url: impl Into<String>) -> Self {
        Self {
            backend,
            storage_base_url: storage_base_url.into(),
            confirm_uploads: false,
        }
    }

    /// 写入前逐条确认上传
    pub fn with_confirmation(mut self, confirm_uploads: bool) -> Self {
        self.confirm_uploads = confirm_uploads;
        self
    }

    pub fn storage_url(&self, storage_key: &str) -> String {
        format!("{}/{}", self.storage_base_url.trim_end_matches('/'), storage_key)
    }

    pub fn entry_for(&self, record: &UploadRecord) -> Option<PhotoEntry> {
        let storage_key = record.storage_key()?;
        Some(PhotoEntry {
            file_name: record.source.name.clone(),
            storage_url: self.storage_url(storage_key),
            file_size: record.source.size,
            content_type: record.source.content_type.clone(),
        })
    }

    /// 把成功的记录写入目标容器
    ///
    /// 目标为新容器时先创建。批量写入失败后退回逐条写入，
    /// 仍然失败的条目记在报告里，不会让整次提交失败。
    pub async fn commit(&self, target: &ContainerTarget, records: &[UploadRecord]) -> Result<CommitReport> {
        if self.confirm_uploads {
            self.confirm_all(records).await;
        }

        let container = match target {
            ContainerTarget::Existing { id } => *id,
            ContainerTarget::New { name } => {
                let id = self.backend.create_container(name.trim()).await?;
                info!(container = %id, name = %name, "created container");
                id
            }
        };

        let (keys, entries): (Vec<&str>, Vec<PhotoEntry>) = records
            .iter()
            .filter_map(|r| Some((r.storage_key()?, self.entry_for(r)?)))
            .unzip();
        if entries.is_empty() {
            return Ok(CommitReport {
                container,
                inserted: 0,
                fallback_used: false,
                failed_keys: Vec::new(),
            });
        }

        match self.backend.insert_batch(container, &entries).await {
            Ok(inserted) => {
                info!(container = %container, inserted, "bulk insert committed");
                Ok(CommitReport {
                    container,
                    inserted,
                    fallback_used: false,
                    failed_keys: Vec::new(),
                })
            }
            Err(e) => {
                warn!(container = %container, "bulk insert failed, falling back to single inserts: {}", e);
                let mut inserted = 0;
                let mut failed_keys = Vec::new();
                for (key, entry) in keys.iter().zip(entries.iter()) {
                    match self.backend.insert_one(container, entry).await {
                        Ok(()) => inserted += 1,
                        Err(e) => {
                            warn!(file = %entry.file_name, "single insert failed: {}", e);
                            failed_keys.push(key.to_string());
                        }
                    }
                }
                Ok(CommitReport {
                    container,
                    inserted,
                    fallback_used: true,
                    failed_keys,
                })
            }
        }
    }

    async fn confirm_all(&self, records: &[UploadRecord]) {
        for confirmation in records.iter().filter_map(UploadConfirmation::from_record) {
            match self.backend.confirm_upload(&confirmation).await {
                Ok(()) => debug!(key = %confirmation.storage_key, "upload confirmed"),
                Err(e) => warn!(key = %confirmation.storage_key, "confirm failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::TransferError;
    use crate::core::types::{ContainerId, Destination, FileHandle};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockBackend {
        fail_bulk: bool,
        reject_file: Option<String>,
        created: Mutex<Vec<String>>,
        singles: Mutex<Vec<PhotoEntry>>,
        confirmed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RegistryBackend for MockBackend {
        async fn create_container(&self, name: &str) -> Result<ContainerId> {
            self.created.lock().push(name.to_string());
            Ok(ContainerId(42))
        }

        async fn insert_batch(&self, _container: ContainerId, entries: &[PhotoEntry]) -> Result<usize> {
            if self.fail_bulk {
                return Err(TransferError::server_error(500, "bulk insert failed"));
            }
            Ok(entries.len())
        }

        async fn insert_one(&self, _container: ContainerId, entry: &PhotoEntry) -> Result<()> {
            if self.reject_file.as_deref() == Some(entry.file_name.as_str()) {
                return Err(TransferError::server_error(400, "malformed"));
            }
            self.singles.lock().push(entry.clone());
            Ok(())
        }

        async fn confirm_upload(&self, confirmation: &UploadConfirmation) -> Result<()> {
            self.confirmed.lock().push(confirmation.storage_key.clone());
            Ok(())
        }
    }

    fn uploaded(name: &str) -> UploadRecord {
        let file = FileHandle::from_bytes(name, Utc::now(), Bytes::from_static(b"jpeg"));
        let modified = file.modified;
        let mut record = UploadRecord::new(file, modified);
        record.destination = Some(Destination {
            url: format!("https://storage.test/put/{}", name),
            storage_key: format!("uploads/7/{}", name),
        });
        record
    }

    #[tokio::test]
    async fn test_bulk_commit_into_new_container() {
        let backend = Arc::new(MockBackend::default());
        let registrar = BatchRegistrar::new(backend.clone(), "https://cdn.test/bucket/");
        let records = vec![uploaded("a.jpg"), uploaded("b.jpg")];

        let report = registrar
            .commit(&ContainerTarget::New { name: " Wedding ".into() }, &records)
            .await
            .unwrap();

        assert_eq!(report.container, ContainerId(42));
        assert_eq!(report.inserted, 2);
        assert!(!report.fallback_used);
        assert_eq!(backend.created.lock().clone(), vec!["Wedding".to_string()]);
        assert!(backend.confirmed.lock().is_empty());
        assert_eq!(
            registrar.storage_url("uploads/7/a.jpg"),
            "https://cdn.test/bucket/uploads/7/a.jpg"
        );
    }

    #[tokio::test]
    async fn test_fallback_to_single_inserts() {
        let backend = Arc::new(MockBackend {
            fail_bulk: true,
            reject_file: Some("b.jpg".into()),
            ..Default::default()
        });
        let registrar = BatchRegistrar::new(backend.clone(), "https://cdn.test").with_confirmation(true);
        let records = vec![uploaded("a.jpg"), uploaded("b.jpg"), uploaded("c.jpg")];

        let report = registrar
            .commit(&ContainerTarget::Existing { id: ContainerId(5) }, &records)
            .await
            .unwrap();

        assert!(report.fallback_used);
        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed_keys, vec!["uploads/7/b.jpg".to_string()]);
        assert!(backend.created.lock().is_empty());
        assert_eq!(backend.confirmed.lock().len(), 3);
        assert_eq!(backend.singles.lock().len(), 2);
    }
}
