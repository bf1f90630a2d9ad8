use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::errors::{ErrorClass, Result, TransferError};
use super::progress::{ProgressReporter, ProgressUpdate};
use super::store::StoreWriter;
use super::traits::TransferExecutor;
use super::types::{UploadId, UploadStatus};
use crate::network::{Connectivity, NetworkMonitor};
use crate::utils::{RetryCoordinator, RetryDecision};

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

type TransferJob = BoxFuture<'static, (UploadId, Result<()>)>;

/// 在并发上限内执行一组已拿到上传地址的记录
///
/// 重试等待、离线暂停、重连恢复都在这个循环里完成，返回本轮成功的记录。
pub(crate) struct ChunkScheduler<'a> {
    pub writer: &'a StoreWriter,
    pub executor: &'a Arc<dyn TransferExecutor>,
    pub retry: &'a RetryCoordinator,
    pub monitor: &'a NetworkMonitor,
    pub network: &'a mut watch::Receiver<Connectivity>,
    /// 本轮处理的记录，重连重试只针对这些记录
    pub pass: &'a HashSet<UploadId>,
    pub token: &'a CancellationToken,
    pub max_concurrent: usize,
}

impl ChunkScheduler<'_> {
    pub async fn drain(self, ready: Vec<UploadId>) -> Vec<UploadId> {
        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(PROGRESS_CHANNEL_CAPACITY);
        let mut queue: VecDeque<UploadId> = ready.into();
        let mut in_flight: JoinSet<(UploadId, Result<()>)> = JoinSet::new();
        let mut backoff: JoinSet<UploadId> = JoinSet::new();
        let mut succeeded = Vec::new();
        let mut cancel_seen = false;
        let mut network_closed = false;

        loop {
            let cancelled = self.token.is_cancelled();
            let online = network_closed || self.monitor.current().is_online();

            if !cancelled && online {
                while in_flight.len() < self.max_concurrent {
                    let Some(id) = queue.pop_front() else { break };
                    if let Some(job) = self.launch(id, &progress_tx) {
                        in_flight.spawn(job);
                    }
                }
            }

            if in_flight.is_empty() && backoff.is_empty() {
                if cancelled {
                    break;
                }
                if online {
                    // 空闲时接手离线期间失败的记录
                    let requeued = self.writer.schedule_reconnect_retries(self.retry.max_retries(), Some(self.pass));
                    if requeued.is_empty() {
                        break;
                    }
                    queue.extend(requeued);
                    continue;
                }
                let waiting = self
                    .writer
                    .read()
                    .has_reconnect_candidates(self.retry.max_retries(), Some(self.pass));
                if queue.is_empty() && !waiting {
                    break;
                }
            }

            tokio::select! {
                Some(joined) = in_flight.join_next() => match joined {
                    Ok((id, result)) => {
                        if let Some(id) = self.settle(id, result, &mut backoff) {
                            succeeded.push(id);
                        }
                    }
                    Err(e) => error!("transfer task failed: {}", e),
                },
                Some(joined) = backoff.join_next() => {
                    if let Ok(id) = joined {
                        queue.push_front(id);
                    }
                }
                Some(update) = progress_rx.recv() => self.writer.record_progress(&update),
                changed = self.network.changed(), if !network_closed => {
                    if changed.is_err() {
                        network_closed = true;
                    } else if self.network.borrow_and_update().is_online() {
                        let requeued = self.writer.schedule_reconnect_retries(self.retry.max_retries(), Some(self.pass));
                        info!(requeued = requeued.len(), "connectivity restored, resuming dispatch");
                        queue.extend(requeued);
                    } else {
                        info!(in_flight = in_flight.len(), "connectivity lost, dispatch paused");
                    }
                }
                _ = self.token.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    info!(in_flight = in_flight.len(), queued = queue.len(), "cancellation requested, stopping dispatch");
                }
            }
        }

        succeeded
    }

    fn launch(&self, id: UploadId, progress_tx: &mpsc::Sender<ProgressUpdate>) -> Option<TransferJob> {
        let Some((record, destination)) = self.writer.begin_transfer(&id) else {
            debug!(upload_id = %id, "record not ready for transfer");
            return None;
        };

        let executor = Arc::clone(self.executor);
        let cancel = self.token.child_token();
        let reporter = ProgressReporter::new(id, record.size(), progress_tx.clone());

        let job = async move {
            let transfer = AssertUnwindSafe(executor.transfer(&record, &destination, reporter, cancel.clone())).catch_unwind();
            let result = tokio::select! {
                biased;
                outcome = transfer => outcome.unwrap_or_else(|_| Err(TransferError::internal_error("transfer panicked"))),
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
            };
            (id, result)
        };
        Some(job.boxed())
    }

    /// 处理单个传输结果，成功时返回记录 id
    fn settle(
        &self,
        id: UploadId,
        result: Result<()>,
        backoff: &mut JoinSet<UploadId>,
    ) -> Option<UploadId> {
        let error = match result {
            Ok(()) => {
                debug!(upload_id = %id, "transfer completed");
                return self.writer.transition(&id, UploadStatus::Success).then_some(id);
            }
            Err(error) => error,
        };

        if self.token.is_cancelled() || error.class() == ErrorClass::Cancelled {
            self.writer.transition(&id, UploadStatus::Cancelled);
            return None;
        }

        // 离线导致的失败不消耗重试次数，等待重连
        if error.class() == ErrorClass::Network && !self.monitor.current().is_online() {
            warn!(upload_id = %id, "transfer failed while offline: {}", error);
            self.writer.mark_failed(&id, &error);
            return None;
        }

        let attempt = self.writer.retry_count(&id);
        match self.retry.should_retry(&error, attempt) {
            RetryDecision::Retry(delay) => {
                warn!(upload_id = %id, attempt = attempt + 1, "transfer failed, retrying in {:?}: {}", delay, error);
                if self.writer.schedule_retry(&id) {
                    let token = self.token.clone();
                    backoff.spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = token.cancelled() => {}
                        }
                        id
                    });
                }
            }
            RetryDecision::GiveUp => {
                warn!(upload_id = %id, attempts = attempt, "transfer failed: {}", error);
                self.writer.mark_failed(&id, &error);
            }
            RetryDecision::Cancel => {
                self.writer.transition(&id, UploadStatus::Cancelled);
            }
        }
        None
    }
}
