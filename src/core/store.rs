use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{RwLock, RwLockReadGuard};
use tokio::sync::broadcast;

use super::errors::{ErrorClass, TransferError};
use super::progress::ProgressUpdate;
use super::types::{Destination, StatusCounts, UploadEvent, UploadId, UploadRecord, UploadStatus};

/// 记录存储，只由编排器写入
#[derive(Debug, Default)]
pub struct RecordStore {
    records: Vec<UploadRecord>,
    index: HashMap<UploadId, usize>,
}

/// 状态机
pub fn is_valid_transition(from: UploadStatus, to: UploadStatus) -> bool {
    use UploadStatus::*;

    matches!(
        (from, to),
        (Pending, Uploading)
            | (Pending, Skipped)
            | (Pending, Cancelled)
            | (Uploading, Success)
            | (Uploading, Error)
            | (Uploading, Retrying)
            | (Uploading, Cancelled)
            | (Retrying, Uploading)
            | (Retrying, Cancelled)
            | (Error, Retrying)
            | (Error, Pending)
            | (Error, Cancelled)
    )
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 重复的 ID 会被忽略
    pub fn insert(&mut self, record: UploadRecord) -> bool {
        if self.index.contains_key(&record.id) {
            return false;
        }
        self.index.insert(record.id, self.records.len());
        self.records.push(record);
        true
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &UploadId) -> Option<&UploadRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    fn get_mut(&mut self, id: &UploadId) -> Option<&mut UploadRecord> {
        match self.index.get(id) {
            Some(&i) => self.records.get_mut(i),
            None => None,
        }
    }

    pub fn records(&self) -> &[UploadRecord] {
        &self.records
    }

    pub fn ids_with_status(&self, status: UploadStatus) -> Vec<UploadId> {
        self.records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.id)
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in &self.records {
            counts.add(record.status);
        }
        counts
    }

    /// 执行状态迁移，返回迁移前的状态；非法迁移返回 None
    pub fn transition(&mut self, id: &UploadId, to: UploadStatus) -> Option<UploadStatus> {
        let record = self.get_mut(id)?;
        let from = record.status;
        if !is_valid_transition(from, to) {
            tracing::debug!(upload_id = %id, %from, %to, "rejected status transition");
            return None;
        }

        record.status = to;
        if from == UploadStatus::Uploading {
            record.transfer_speed = 0.0;
        }
        match to {
            UploadStatus::Uploading => {
                record.progress_percent = 0.0;
                record.started_at = Some(Utc::now());
            }
            UploadStatus::Success => {
                record.progress_percent = 100.0;
                record.completed_at = Some(Utc::now());
            }
            UploadStatus::Error | UploadStatus::Cancelled | UploadStatus::Skipped => {
                record.completed_at = Some(Utc::now());
            }
            UploadStatus::Pending | UploadStatus::Retrying => {}
        }
        if to != UploadStatus::Error {
            record.error_message = None;
            record.error_class = None;
        }
        Some(from)
    }

    /// 只在尚未分配时写入
    pub fn assign_destination(&mut self, id: &UploadId, destination: Destination) -> bool {
        match self.get_mut(id) {
            Some(record) if record.destination.is_none() => {
                record.destination = Some(destination);
                true
            }
            _ => false,
        }
    }

    pub fn record_progress(&mut self, update: &ProgressUpdate) {
        let Some(record) = self.get_mut(&update.upload_id) else {
            return;
        };
        if record.status != UploadStatus::Uploading {
            return;
        }
        let percent = update.percent();
        if percent > record.progress_percent {
            record.progress_percent = percent;
        }
        record.transfer_speed = update.speed;
    }

    pub fn mark_uploading(&mut self, id: &UploadId) -> Option<UploadStatus> {
        self.transition(id, UploadStatus::Uploading)
    }

    pub fn mark_success(&mut self, id: &UploadId) -> Option<UploadStatus> {
        self.transition(id, UploadStatus::Success)
    }

    pub fn mark_failed(&mut self, id: &UploadId, error: &TransferError) -> Option<UploadStatus> {
        let from = self.transition(id, UploadStatus::Error)?;
        if let Some(record) = self.get_mut(id) {
            record.error_message = Some(error.to_string());
            record.error_class = Some(error.class());
        }
        Some(from)
    }

    pub fn mark_cancelled(&mut self, id: &UploadId) -> Option<UploadStatus> {
        self.transition(id, UploadStatus::Cancelled)
    }

    /// 进入重试，retry_count 加一
    pub fn schedule_retry(&mut self, id: &UploadId) -> Option<UploadStatus> {
        let from = self.transition(id, UploadStatus::Retrying)?;
        if let Some(record) = self.get_mut(id) {
            record.retry_count += 1;
        }
        Some(from)
    }

    /// 网络恢复后自动重试：Error 且为网络类、仍有重试次数的记录进入 Retrying
    ///
    /// `scope` 为 None 时处理全部记录，否则只处理给定的记录
    pub fn schedule_reconnect_retries(
        &mut self,
        max_retries: u32,
        scope: Option<&HashSet<UploadId>>,
    ) -> Vec<(UploadId, UploadStatus)> {
        let eligible = self.reconnect_candidates(max_retries, scope);

        let mut scheduled = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(from) = self.transition(&id, UploadStatus::Retrying) {
                if let Some(record) = self.get_mut(&id) {
                    record.retry_count += 1;
                }
                scheduled.push((id, from));
            }
        }
        scheduled
    }

    pub fn has_reconnect_candidates(&self, max_retries: u32, scope: Option<&HashSet<UploadId>>) -> bool {
        self.records
            .iter()
            .any(|r| in_scope(r, scope) && is_reconnect_candidate(r, max_retries))
    }

    fn reconnect_candidates(&self, max_retries: u32, scope: Option<&HashSet<UploadId>>) -> Vec<UploadId> {
        self.records
            .iter()
            .filter(|r| in_scope(r, scope) && is_reconnect_candidate(r, max_retries))
            .map(|r| r.id)
            .collect()
    }

    /// 取消尚未结束的记录，包括等待重连的网络失败记录，返回被取消的记录
    pub fn cancel_unfinished(
        &mut self,
        max_retries: u32,
        scope: Option<&HashSet<UploadId>>,
    ) -> Vec<(UploadId, UploadStatus)> {
        let ids: Vec<UploadId> = self
            .records
            .iter()
            .filter(|r| in_scope(r, scope))
            .filter(|r| {
                matches!(r.status, UploadStatus::Pending | UploadStatus::Retrying)
                    || is_reconnect_candidate(r, max_retries)
            })
            .map(|r| r.id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.mark_cancelled(&id).map(|old| (id, old)))
            .collect()
    }

    /// 手动重试：网络类失败重置为 Pending 并清零重试次数，返回被重置的记录
    pub fn reset_for_manual_retry(&mut self) -> Vec<(UploadId, UploadStatus)> {
        let mut reset = Vec::new();
        for record in self.records.iter_mut() {
            if record.status == UploadStatus::Error && record.error_class == Some(ErrorClass::Network) {
                record.status = UploadStatus::Pending;
                record.retry_count = 0;
                record.progress_percent = 0.0;
                record.error_message = None;
                record.error_class = None;
                record.completed_at = None;
                reset.push((record.id, UploadStatus::Error));
            }
        }
        reset
    }
}

fn in_scope(record: &UploadRecord, scope: Option<&HashSet<UploadId>>) -> bool {
    scope.is_none_or(|ids| ids.contains(&record.id))
}

fn is_reconnect_candidate(record: &UploadRecord, max_retries: u32) -> bool {
    record.status == UploadStatus::Error
        && record.error_class == Some(ErrorClass::Network)
        && record.retry_count < max_retries
}

/// 只读视图，交给编排器之外的组件
#[derive(Debug, Clone)]
pub struct StoreReader(Arc<RwLock<RecordStore>>);

impl StoreReader {
    pub fn new(store: Arc<RwLock<RecordStore>>) -> Self {
        Self(store)
    }

    pub fn inspect<R>(&self, f: impl FnOnce(&[UploadRecord]) -> R) -> R {
        let store = self.0.read();
        f(store.records())
    }

    pub fn snapshot(&self) -> Vec<UploadRecord> {
        self.inspect(|records| records.to_vec())
    }

    pub fn get(&self, id: &UploadId) -> Option<UploadRecord> {
        self.0.read().get(id).cloned()
    }

    pub fn counts(&self) -> StatusCounts {
        self.0.read().counts()
    }
}

/// 编排器持有的写入端，每次状态迁移都会广播事件
#[derive(Debug, Clone)]
pub(crate) struct StoreWriter {
    store: Arc<RwLock<RecordStore>>,
    events: broadcast::Sender<UploadEvent>,
}

impl StoreWriter {
    pub fn new(events: broadcast::Sender<UploadEvent>) -> Self {
        Self {
            store: Arc::new(RwLock::new(RecordStore::new())),
            events,
        }
    }

    pub fn reader(&self) -> StoreReader {
        StoreReader::new(Arc::clone(&self.store))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RecordStore> {
        self.store.read()
    }

    /// 替换全部记录，`deselected` 中的记录直接跳过
    pub fn load(&self, records: Vec<UploadRecord>, deselected: &HashSet<UploadId>) -> Vec<UploadId> {
        let skipped = {
            let mut store = self.store.write();
            store.clear();
            for record in records {
                if !store.insert(record) {
                    tracing::debug!("duplicate record ignored");
                }
            }
            deselected
                .iter()
                .filter_map(|id| store.transition(id, UploadStatus::Skipped).map(|old| (*id, old)))
                .collect::<Vec<_>>()
        };
        for (id, old) in skipped {
            self.emit(id, old, UploadStatus::Skipped);
        }
        self.store.read().ids_with_status(UploadStatus::Pending)
    }

    pub fn assign_destination(&self, id: &UploadId, destination: Destination) -> bool {
        self.store.write().assign_destination(id, destination)
    }

    pub fn record_progress(&self, update: &ProgressUpdate) {
        self.store.write().record_progress(update);
    }

    /// 进入 Uploading，返回记录快照；记录不存在、无目标地址或状态不允许时返回 None
    pub fn begin_transfer(&self, id: &UploadId) -> Option<(UploadRecord, Destination)> {
        let (record, destination, old) = {
            let mut store = self.store.write();
            let destination = store.get(id)?.destination.clone()?;
            let old = store.mark_uploading(id)?;
            (store.get(id)?.clone(), destination, old)
        };
        self.emit(*id, old, UploadStatus::Uploading);
        Some((record, destination))
    }

    pub fn transition(&self, id: &UploadId, to: UploadStatus) -> bool {
        let old = self.store.write().transition(id, to);
        self.emit_if(id, old, to)
    }

    pub fn mark_failed(&self, id: &UploadId, error: &TransferError) -> bool {
        let old = self.store.write().mark_failed(id, error);
        self.emit_if(id, old, UploadStatus::Error)
    }

    pub fn schedule_retry(&self, id: &UploadId) -> bool {
        let old = self.store.write().schedule_retry(id);
        self.emit_if(id, old, UploadStatus::Retrying)
    }

    pub fn retry_count(&self, id: &UploadId) -> u32 {
        self.store.read().get(id).map(|r| r.retry_count).unwrap_or(0)
    }

    pub fn schedule_reconnect_retries(&self, max_retries: u32, scope: Option<&HashSet<UploadId>>) -> Vec<UploadId> {
        let scheduled = self.store.write().schedule_reconnect_retries(max_retries, scope);
        scheduled
            .into_iter()
            .map(|(id, old)| {
                self.emit(id, old, UploadStatus::Retrying);
                id
            })
            .collect()
    }

    pub fn reset_for_manual_retry(&self) -> usize {
        let reset = self.store.write().reset_for_manual_retry();
        let count = reset.len();
        for (id, old) in reset {
            self.emit(id, old, UploadStatus::Pending);
        }
        count
    }

    /// 取消尚未结束的记录，已成功或被拒绝的记录保持不变
    pub fn cancel_unfinished(&self, max_retries: u32, scope: Option<&HashSet<UploadId>>) -> usize {
        let cancelled = self.store.write().cancel_unfinished(max_retries, scope);
        let count = cancelled.len();
        for (id, old) in cancelled {
            self.emit(id, old, UploadStatus::Cancelled);
        }
        count
    }

    fn emit_if(&self, id: &UploadId, old: Option<UploadStatus>, new_status: UploadStatus) -> bool {
        match old {
            Some(old_status) => {
                self.emit(*id, old_status, new_status);
                true
            }
            None => false,
        }
    }

    fn emit(&self, upload_id: UploadId, old_status: UploadStatus, new_status: UploadStatus) {
        let _ = self.events.send(UploadEvent::StateChanged {
            upload_id,
            old_status,
            new_status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileHandle;
    use bytes::Bytes;

    fn record(name: &str) -> UploadRecord {
        let file = FileHandle::from_bytes(name, Utc::now(), Bytes::from_static(b"0123456789"));
        let modified = file.modified;
        UploadRecord::new(file, modified)
    }

    fn destination(key: &str) -> Destination {
        Destination {
            url: format!("https://storage.test/{}", key),
            storage_key: key.to_string(),
        }
    }

    #[test]
    fn test_duplicate_insert_ignored() {
        let mut store = RecordStore::new();
        let r = record("a.jpg");
        assert!(store.insert(r.clone()));
        assert!(!store.insert(r));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_destination_is_immutable() {
        let mut store = RecordStore::new();
        let r = record("a.jpg");
        let id = r.id;
        store.insert(r);

        assert!(store.assign_destination(&id, destination("first")));
        assert!(!store.assign_destination(&id, destination("second")));
        assert_eq!(store.get(&id).and_then(|r| r.storage_key()), Some("first"));
    }

    #[test]
    fn test_progress_is_monotonic_while_uploading() {
        let mut store = RecordStore::new();
        let r = record("a.jpg");
        let id = r.id;
        store.insert(r);

        let update = |bytes_sent| ProgressUpdate {
            upload_id: id,
            bytes_sent,
            total_bytes: 10,
            speed: 5.0,
        };

        // Pending 状态下忽略
        store.record_progress(&update(5));
        assert_eq!(store.get(&id).map(|r| r.progress_percent), Some(0.0));

        store.mark_uploading(&id);
        store.record_progress(&update(6));
        store.record_progress(&update(3));
        assert_eq!(store.get(&id).map(|r| r.progress_percent), Some(60.0));

        store.mark_success(&id);
        let r = store.get(&id).cloned().unwrap();
        assert_eq!(r.progress_percent, 100.0);
        assert_eq!(r.transfer_speed, 0.0);
    }

    #[test]
    fn test_reconnect_retries_respect_class_and_bound() {
        let mut store = RecordStore::new();
        let network = record("network.jpg");
        let rejected = record("rejected.jpg");
        let exhausted = record("exhausted.jpg");
        let ids = [network.id, rejected.id, exhausted.id];
        for r in [network, rejected, exhausted] {
            store.insert(r);
        }
        for id in &ids {
            store.mark_uploading(id);
        }

        store.mark_failed(&ids[0], &TransferError::Network("reset".into()));
        store.mark_failed(&ids[1], &TransferError::server_error(415, "bad type"));
        for _ in 0..3 {
            store.schedule_retry(&ids[2]);
            store.mark_uploading(&ids[2]);
        }
        store.mark_failed(&ids[2], &TransferError::Network("reset".into()));

        let scheduled = store.schedule_reconnect_retries(3, None);
        assert_eq!(scheduled, vec![(ids[0], UploadStatus::Error)]);
        assert_eq!(store.get(&ids[0]).map(|r| r.retry_count), Some(1));
        assert_eq!(store.get(&ids[1]).map(|r| r.status), Some(UploadStatus::Error));
        assert_eq!(store.get(&ids[2]).map(|r| r.retry_count), Some(3));

        // 第二次不会重复调度
        assert!(store.schedule_reconnect_retries(3, None).is_empty());
    }

    #[test]
    fn test_cancel_unfinished_within_scope() {
        let mut store = RecordStore::new();
        let network = record("network.jpg");
        let rejected = record("rejected.jpg");
        let exhausted = record("exhausted.jpg");
        let outside = record("outside.jpg");
        let ids = [network.id, rejected.id, exhausted.id, outside.id];
        for r in [network, rejected, exhausted, outside] {
            store.insert(r);
        }
        for id in &ids {
            store.mark_uploading(id);
        }

        store.mark_failed(&ids[0], &TransferError::Network("offline".into()));
        store.mark_failed(&ids[1], &TransferError::server_error(415, "bad type"));
        for _ in 0..3 {
            store.schedule_retry(&ids[2]);
            store.mark_uploading(&ids[2]);
        }
        store.mark_failed(&ids[2], &TransferError::Network("reset".into()));
        store.mark_failed(&ids[3], &TransferError::Network("offline".into()));

        let scope: HashSet<UploadId> = ids[..3].iter().copied().collect();
        let cancelled = store.cancel_unfinished(3, Some(&scope));
        assert_eq!(cancelled, vec![(ids[0], UploadStatus::Error)]);
        assert_eq!(store.get(&ids[1]).map(|r| r.status), Some(UploadStatus::Error));
        assert_eq!(store.get(&ids[2]).map(|r| r.status), Some(UploadStatus::Error));

        // 范围外的记录仍等待重连
        assert!(store.has_reconnect_candidates(3, None));
        assert!(!store.has_reconnect_candidates(3, Some(&scope)));
        assert_eq!(store.get(&ids[3]).map(|r| r.status), Some(UploadStatus::Error));
    }

    #[test]
    fn test_manual_retry_resets_network_failures_only() {
        let mut store = RecordStore::new();
        let a = record("a.jpg");
        let b = record("b.jpg");
        let (ida, idb) = (a.id, b.id);
        store.insert(a);
        store.insert(b);
        store.mark_uploading(&ida);
        store.mark_uploading(&idb);
        store.schedule_retry(&ida);
        store.mark_uploading(&ida);
        store.mark_failed(&ida, &TransferError::Network("timeout".into()));
        store.mark_failed(&idb, &TransferError::server_error(403, "quota"));

        let reset = store.reset_for_manual_retry();
        assert_eq!(reset.len(), 1);
        let r = store.get(&ida).cloned().unwrap();
        assert_eq!(r.status, UploadStatus::Pending);
        assert_eq!(r.retry_count, 0);
        assert!(r.error_message.is_none());
        assert_eq!(store.get(&idb).map(|r| r.status), Some(UploadStatus::Error));
    }
}
