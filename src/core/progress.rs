use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::store::StoreReader;
use super::types::{StatusCounts, UploadId, UploadRecord, UploadSession, UploadStatus};
use crate::utils::progress::SpeedCalculator;

/// 单个文件最多每 200ms 发送一次进度
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

/// 进度更新消息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub upload_id: UploadId,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    /// 瞬时速度（字节/秒）
    pub speed: f64,
}

impl ProgressUpdate {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_sent as f64 * 100.0 / self.total_bytes as f64).min(100.0)
    }
}

/// 交给传输执行器的进度上报器
///
/// 通道满时直接丢弃本次更新，下一次更新会带上更新后的累计值。
#[derive(Debug)]
pub struct ProgressReporter {
    upload_id: UploadId,
    total_bytes: u64,
    bytes_sent: u64,
    tx: mpsc::Sender<ProgressUpdate>,
    min_interval: Duration,
    last_emit: Option<Instant>,
    speed: SpeedCalculator,
}

impl ProgressReporter {
    pub fn new(upload_id: UploadId, total_bytes: u64, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            upload_id,
            total_bytes,
            bytes_sent: 0,
            tx,
            min_interval: PROGRESS_THROTTLE,
            last_emit: None,
            speed: SpeedCalculator::new(Duration::from_secs(3)),
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// 记录新发送的字节
    pub fn advance(&mut self, bytes: u64) {
        let now = Instant::now();
        self.bytes_sent = self.bytes_sent.saturating_add(bytes);
        self.speed.add_sample(now, self.bytes_sent);

        let due = match self.last_emit {
            Some(last) => now.duration_since(last) >= self.min_interval,
            None => true,
        };
        if due {
            self.emit(now);
        }
    }

    /// 流结束时强制发送最后一次
    pub fn finish(&mut self) {
        self.emit(Instant::now());
    }

    fn emit(&mut self, now: Instant) {
        self.last_emit = Some(now);
        let _ = self.tx.try_send(ProgressUpdate {
            upload_id: self.upload_id,
            bytes_sent: self.bytes_sent,
            total_bytes: self.total_bytes,
            speed: self.speed.speed(),
        });
    }
}

/// 进度聚合器，按固定间隔从记录快照计算会话统计
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    interval: Duration,
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

impl ProgressAggregator {
    pub const MIN_INTERVAL: Duration = Duration::from_millis(300);
    pub const MAX_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(400);

    /// 间隔限制在 300..=500ms
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.clamp(Self::MIN_INTERVAL, Self::MAX_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 从记录快照重新计算会话统计
    ///
    /// 吞吐量取上传中记录瞬时速度的平均值。
    /// 剩余时间按已成功文件的平均耗时乘以未成功的文件数估算。
    pub fn recompute(session: &UploadSession, records: &[UploadRecord], elapsed: Duration) -> UploadSession {
        let mut counts = StatusCounts::default();
        let mut speed_sum = 0.0;
        for record in records {
            counts.add(record.status);
            if record.status == UploadStatus::Uploading {
                speed_sum += record.transfer_speed;
            }
        }

        let average_throughput = if counts.uploading > 0 {
            speed_sum / counts.uploading as f64
        } else {
            0.0
        };

        let estimated_seconds_remaining = if counts.success > 0 {
            let per_file = elapsed.as_secs_f64() / counts.success as f64;
            let outstanding = records.len().saturating_sub(counts.success);
            Some((per_file * outstanding as f64).round() as u64)
        } else {
            None
        };

        UploadSession {
            started_at: session.started_at,
            total_files: records.len(),
            completed_files: counts.success,
            failed_files: counts.error,
            cancelled_files: counts.cancelled,
            estimated_seconds_remaining,
            average_throughput,
        }
    }

    /// 启动后台刷新任务
    pub fn start(
        &self,
        reader: StoreReader,
        session_tx: Arc<watch::Sender<Option<UploadSession>>>,
    ) -> ProgressAggregatorHandle {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let clock = Instant::now();
            let mut session = UploadSession::new(Utc::now(), reader.inspect(|records| records.len()));
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        session = reader.inspect(|records| Self::recompute(&session, records, clock.elapsed()));
                        session_tx.send_replace(Some(session.clone()));
                    }
                }
            }

            // 结束前发布最终状态
            session = reader.inspect(|records| Self::recompute(&session, records, clock.elapsed()));
            session_tx.send_replace(Some(session));
        });

        ProgressAggregatorHandle {
            cancellation_token,
            handle,
        }
    }
}

pub struct ProgressAggregatorHandle {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressAggregatorHandle {
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!("progress aggregator task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileHandle;
    use bytes::Bytes;

    fn record(name: &str, status: UploadStatus, speed: f64) -> UploadRecord {
        let file = FileHandle::from_bytes(name, Utc::now(), Bytes::from_static(b"data"));
        let modified = file.modified;
        let mut record = UploadRecord::new(file, modified);
        record.status = status;
        record.transfer_speed = speed;
        record
    }

    #[test]
    fn test_recompute_before_first_completion() {
        let session = UploadSession::new(Utc::now(), 2);
        let records = vec![
            record("a.jpg", UploadStatus::Uploading, 100.0),
            record("b.jpg", UploadStatus::Pending, 0.0),
        ];

        let next = ProgressAggregator::recompute(&session, &records, Duration::from_secs(4));
        assert_eq!(next.completed_files, 0);
        assert_eq!(next.estimated_seconds_remaining, None);
        assert_eq!(next.average_throughput, 100.0);
    }

    #[test]
    fn test_recompute_rules() {
        let session = UploadSession::new(Utc::now(), 6);
        let records = vec![
            record("a.jpg", UploadStatus::Success, 0.0),
            record("b.jpg", UploadStatus::Success, 0.0),
            record("c.jpg", UploadStatus::Uploading, 300.0),
            record("d.jpg", UploadStatus::Uploading, 100.0),
            record("e.jpg", UploadStatus::Pending, 0.0),
            record("f.jpg", UploadStatus::Cancelled, 0.0),
        ];

        let next = ProgressAggregator::recompute(&session, &records, Duration::from_secs(10));
        assert_eq!(next.total_files, 6);
        assert_eq!(next.completed_files, 2);
        assert_eq!(next.cancelled_files, 1);
        assert_eq!(next.average_throughput, 200.0);
        // 每个文件 5 秒，还剩 4 个
        assert_eq!(next.estimated_seconds_remaining, Some(20));
        assert_eq!(next.started_at, session.started_at);
    }

    #[test]
    fn test_interval_is_clamped() {
        assert_eq!(ProgressAggregator::new(Duration::from_millis(10)).interval(), Duration::from_millis(300));
        assert_eq!(ProgressAggregator::new(Duration::from_secs(5)).interval(), Duration::from_millis(500));
        assert_eq!(ProgressAggregator::default().interval(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_reporter_throttles_updates() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut reporter = ProgressReporter::new(UploadId::new(), 100, tx)
            .with_min_interval(Duration::from_secs(60));

        for _ in 0..10 {
            reporter.advance(10);
        }
        reporter.finish();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.bytes_sent, 10);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.bytes_sent, 100);
        assert_eq!(last.percent(), 100.0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reporter_drops_when_channel_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut reporter = ProgressReporter::new(UploadId::new(), 10, tx).with_min_interval(Duration::ZERO);

        reporter.advance(1);
        reporter.advance(1);
        reporter.advance(1);

        assert_eq!(rx.recv().await.map(|u| u.bytes_sent), Some(1));
        assert!(rx.try_recv().is_err());
    }
}
