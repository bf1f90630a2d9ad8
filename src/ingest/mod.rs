mod capture;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use tracing::{debug, warn};

use crate::core::{ContainerTarget, FileHandle, UploadBatch, UploadId, UploadRecord};

pub use capture::{CaptureTimeExtractor, ExifCaptureExtractor, CAPTURE_HEADER_LIMIT};

/// 把原始文件选择整理为待上传记录
///
/// 图片文件尝试读取拍摄时间，失败时使用文件修改时间；不做任何网络请求。
pub struct FileIngestQueue<E = ExifCaptureExtractor> {
    extractor: E,
    /// 相机本地时间所在时区
    offset: FixedOffset,
    records: Vec<UploadRecord>,
    ids: HashSet<UploadId>,
}

impl Default for FileIngestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIngestQueue {
    pub fn new() -> Self {
        Self::with_extractor(ExifCaptureExtractor)
    }
}

impl<E: CaptureTimeExtractor> FileIngestQueue<E> {
    pub fn with_extractor(extractor: E) -> Self {
        Self {
            extractor,
            offset: Utc.fix(),
            records: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    /// 加入文件，返回新增记录数；重复选择的文件被忽略
    pub async fn ingest(&mut self, files: Vec<FileHandle>) -> usize {
        let mut added = 0;
        for file in files {
            let id = UploadId::derive(&file.name, file.size, file.modified);
            if self.ids.contains(&id) {
                debug!(file = %file.name, "file already queued");
                continue;
            }

            let capture_time = self.capture_time(&file).await;
            let record = UploadRecord::new(file, capture_time);
            self.ids.insert(record.id);
            self.records.push(record);
            added += 1;
        }
        added
    }

    /// 从路径加入文件，无法读取的路径记录警告后跳过
    pub async fn ingest_paths<P: AsRef<Path>>(&mut self, paths: impl IntoIterator<Item = P>) -> usize {
        let mut files = Vec::new();
        for path in paths {
            let path = path.as_ref();
            match FileHandle::from_path(path).await {
                Ok(file) => files.push(file),
                Err(e) => warn!(path = %path.display(), "skipping unreadable file: {}", e),
            }
        }
        self.ingest(files).await
    }

    pub fn records(&self) -> &[UploadRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 去重后按顺序排列的拍摄日期
    pub fn capture_dates(&self) -> BTreeSet<NaiveDate> {
        self.records.iter().map(|r| self.local_date(r)).collect()
    }

    pub fn into_batch(self, target: ContainerTarget) -> UploadBatch {
        UploadBatch::new(self.records, target)
    }

    /// 只上传某一天拍摄的文件，其余记录标记为未选中
    pub fn into_batch_for_date(self, date: NaiveDate, target: ContainerTarget) -> UploadBatch {
        let others: Vec<UploadId> = self
            .records
            .iter()
            .filter(|r| self.local_date(r) != date)
            .map(|r| r.id)
            .collect();

        others
            .into_iter()
            .fold(UploadBatch::new(self.records, target), UploadBatch::deselect)
    }

    fn local_date(&self, record: &UploadRecord) -> NaiveDate {
        record.capture_time.with_timezone(&self.offset).date_naive()
    }

    async fn capture_time(&self, file: &FileHandle) -> DateTime<Utc> {
        if !file.is_image() {
            return file.modified;
        }

        let header = match capture::read_header(file).await {
            Ok(header) => header,
            Err(e) => {
                debug!(file = %file.name, "cannot read header: {}", e);
                return file.modified;
            }
        };

        self.extractor
            .capture_time(&header)
            .and_then(|naive| self.offset.from_local_datetime(&naive).single())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or(file.modified)
    }
}
