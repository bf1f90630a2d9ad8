use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::api::BackendClient;
use crate::core::{Destination, DestinationProvider, Result, UploadId, UploadRecord};

const BATCH_URLS_PATH: &str = "uploads/batch-urls";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileDescriptor<'a> {
    name: &'a str,
    content_type: &'a str,
    size: u64,
}

#[derive(Debug, Serialize)]
struct BatchUrlsRequest<'a> {
    files: Vec<FileDescriptor<'a>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IssuedUpload {
    #[serde(alias = "filename")]
    pub name: String,
    pub url: String,
    pub key: String,
}

#[derive(Debug, Deserialize)]
struct BatchUrlsResponse {
    uploads: Vec<IssuedUpload>,
}

/// 一次请求批量获取预签名地址
#[derive(Debug, Clone)]
pub struct PresignedUrlBatchClient {
    api: BackendClient,
    /// 服务端单次请求上限
    max_batch: usize,
}

impl PresignedUrlBatchClient {
    pub const DEFAULT_MAX_BATCH: usize = 100;

    pub fn new(api: BackendClient) -> Self {
        Self {
            api,
            max_batch: Self::DEFAULT_MAX_BATCH,
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    async fn request(&self, records: &[UploadRecord]) -> Result<Vec<IssuedUpload>> {
        let body = BatchUrlsRequest {
            files: records
                .iter()
                .map(|r| FileDescriptor {
                    name: &r.source.name,
                    content_type: &r.source.content_type,
                    size: r.source.size,
                })
                .collect(),
        };
        let response: BatchUrlsResponse = self.api.post_json(BATCH_URLS_PATH, &body).await?;
        Ok(response.uploads)
    }
}

#[async_trait]
impl DestinationProvider for PresignedUrlBatchClient {
    async fn acquire_destinations(&self, records: &[UploadRecord]) -> Result<HashMap<UploadId, Destination>> {
        let mut destinations = HashMap::with_capacity(records.len());
        for batch in records.chunks(self.max_batch) {
            let issued = self.request(batch).await?;
            debug!(requested = batch.len(), issued = issued.len(), "acquired upload urls");
            destinations.extend(match_destinations(batch, issued));
        }

        for record in records {
            if !destinations.contains_key(&record.id) {
                warn!(upload_id = %record.id, file = %record.source.name, "no upload url returned");
            }
        }
        Ok(destinations)
    }
}

/// 按文件名匹配，同名文件按返回顺序依次分配
pub(crate) fn match_destinations(
    records: &[UploadRecord],
    issued: Vec<IssuedUpload>,
) -> HashMap<UploadId, Destination> {
    let mut by_name: HashMap<String, VecDeque<Destination>> = HashMap::new();
    for upload in issued {
        by_name.entry(upload.name).or_default().push_back(Destination {
            url: upload.url,
            storage_key: upload.key,
        });
    }

    records
        .iter()
        .filter_map(|r| {
            let destination = by_name.get_mut(&r.source.name)?.pop_front()?;
            Some((r.id, destination))
        })
        .collect()
}
