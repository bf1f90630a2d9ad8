use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::api::BackendClient;
use crate::core::{ContainerId, PhotoEntry, RegistryBackend, Result, UploadConfirmation};

#[derive(Debug, Serialize)]
struct CreateContainer<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ContainerCreated {
    id: ContainerId,
}

#[derive(Debug, Serialize)]
struct PhotoBatch<'a> {
    photos: &'a [PhotoEntry],
}

#[derive(Debug, Deserialize)]
struct BatchInserted {
    inserted: usize,
}

/// 基于 HTTP 的元数据存储
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    api: BackendClient,
}

impl HttpRegistry {
    pub fn new(api: BackendClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl RegistryBackend for HttpRegistry {
    async fn create_container(&self, name: &str) -> Result<ContainerId> {
        let created: ContainerCreated = self.api.post_json("containers", &CreateContainer { name }).await?;
        Ok(created.id)
    }

    async fn insert_batch(&self, container: ContainerId, entries: &[PhotoEntry]) -> Result<usize> {
        let path = format!("containers/{}/photos/batch", container);
        let inserted: BatchInserted = self.api.post_json(&path, &PhotoBatch { photos: entries }).await?;
        Ok(inserted.inserted)
    }

    async fn insert_one(&self, container: ContainerId, entry: &PhotoEntry) -> Result<()> {
        let path = format!("containers/{}/photos", container);
        self.api.post(&path, entry).await?;
        Ok(())
    }

    async fn confirm_upload(&self, confirmation: &UploadConfirmation) -> Result<()> {
        self.api.post("uploads/confirm", confirmation).await?;
        Ok(())
    }
}
