use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::api::check_status;
use super::progress_stream::ProgressStream;
use crate::core::{ByteSource, Destination, FileHandle, ProgressReporter, Result, TransferError, TransferExecutor, UploadRecord};

/// 读取缓冲区大小，同时也是内存数据的切片大小
const READ_BUFFER: usize = 64 * 1024;

pub type SourceStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// 通过预签名地址 PUT 整个文件
#[derive(Debug, Clone)]
pub struct HttpTransferExecutor {
    client: Client,
}

impl HttpTransferExecutor {
    /// 不设整体超时，大文件只受两次读取之间的间隔限制
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransferExecutor for HttpTransferExecutor {
    async fn transfer(
        &self,
        record: &UploadRecord,
        destination: &Destination,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let body = open_source_stream(&record.source).await?;
        let request = self
            .client
            .put(&destination.url)
            .header(CONTENT_TYPE, record.source.content_type.as_str())
            .header(CONTENT_LENGTH, record.source.size)
            .body(Body::wrap_stream(ProgressStream::new(body, progress)));

        debug!(upload_id = %record.id, key = %destination.storage_key, "transfer started");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = request.send() => response?,
        };
        check_status(response).await?;
        Ok(())
    }
}

/// 打开文件内容流
pub async fn open_source_stream(source: &FileHandle) -> io::Result<SourceStream> {
    match &source.source {
        ByteSource::Path(path) => {
            let file = tokio::fs::File::open(path).await?;
            Ok(Box::pin(ReaderStream::with_capacity(file, READ_BUFFER)))
        }
        ByteSource::Memory(data) => {
            let data = data.clone();
            let len = data.len();
            let slices = (0..len)
                .step_by(READ_BUFFER)
                .map(move |start| Ok(data.slice(start..(start + READ_BUFFER).min(len))));
            Ok(Box::pin(stream::iter(slices)))
        }
    }
}
