use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::errors::{ErrorClass, TransferError, UploadError};
use super::profile::UploadProfile;
use super::progress::ProgressAggregator;
use super::registrar::BatchRegistrar;
use super::scheduler::ChunkScheduler;
use super::store::{StoreReader, StoreWriter};
use super::traits::{DestinationProvider, RegistryBackend, TransferExecutor};
use super::types::{
    ContainerTarget, RegistrationOutcome, StatusCounts, UploadBatch, UploadEvent, UploadId, UploadRecord,
    UploadResults, UploadSession, UploadStatus,
};
use crate::config::Config;
use crate::network::{Connectivity, NetworkMonitor};
use crate::uploaders::{BackendClient, HttpRegistry, HttpTransferExecutor, PresignedUrlBatchClient};
use crate::utils::{format_bytes, format_duration, RetryCoordinator};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 上传编排器
///
/// 负责一次上传的完整流程：分块申请上传地址、限流传输、重试、离线暂停与恢复，
/// 最后把成功的文件注册到目标容器。同一时间只允许一轮处理。
pub struct UploadOrchestrator {
    profile: UploadProfile,
    destinations: Arc<dyn DestinationProvider>,
    executor: Arc<dyn TransferExecutor>,
    registrar: BatchRegistrar,
    retry: RetryCoordinator,
    aggregator: ProgressAggregator,
    monitor: Arc<NetworkMonitor>,
    writer: StoreWriter,
    target: Mutex<Option<ContainerTarget>>,
    pass_token: Mutex<CancellationToken>,
    run_lock: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<UploadEvent>,
    session_tx: Arc<watch::Sender<Option<UploadSession>>>,
}

impl UploadOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// 使用 HTTP 实现组装编排器
    pub fn from_config(config: &Config, monitor: Arc<NetworkMonitor>) -> Result<Self, UploadError> {
        let profile = config.profile()?;
        let api = BackendClient::new(&config.api)?;
        let executor = HttpTransferExecutor::new(config.api.connect_timeout(), config.api.read_timeout())?;

        Self::builder()
            .profile(profile)
            .destinations(Arc::new(PresignedUrlBatchClient::new(api.clone())))
            .executor(Arc::new(executor))
            .registry(Arc::new(HttpRegistry::new(api)), config.api.storage_base_url.clone())
            .network(monitor)
            .build()
    }

    pub fn profile(&self) -> &UploadProfile {
        &self.profile
    }

    /// 处理一个新批次，替换之前的全部记录
    pub async fn run(&self, batch: UploadBatch) -> Result<UploadResults, UploadError> {
        batch.validate()?;
        let _guard = self.run_lock.try_lock().map_err(|_| UploadError::AlreadyRunning)?;

        let UploadBatch {
            records,
            target,
            deselected,
        } = batch;
        let pending = self.writer.load(records, &deselected);
        *self.target.lock() = Some(target);
        self.session_tx.send_replace(None);

        info!(files = pending.len(), skipped = deselected.len(), "upload run started");
        self.execute_pass(pending).await
    }

    /// 手动重试：网络失败的记录重置为 Pending 后与剩余的 Pending 记录一起处理
    ///
    /// 已拿到上传地址的记录直接复用，注册只包含本轮新成功的文件。
    pub async fn retry_failed(&self) -> Result<UploadResults, UploadError> {
        let _guard = self.run_lock.try_lock().map_err(|_| UploadError::AlreadyRunning)?;

        let reset = self.writer.reset_for_manual_retry();
        let pending = self.writer.read().ids_with_status(UploadStatus::Pending);
        info!(reset, pending = pending.len(), "retrying failed uploads");
        if pending.is_empty() {
            return Ok(self.results(RegistrationOutcome::NotAttempted));
        }
        self.execute_pass(pending).await
    }

    /// 网络恢复后重新处理离线期间失败的记录；没有可重试记录时返回 None
    pub async fn resume_after_reconnect(&self) -> Result<Option<UploadResults>, UploadError> {
        let _guard = self.run_lock.try_lock().map_err(|_| UploadError::AlreadyRunning)?;
        if !self.monitor.current().is_online() {
            return Ok(None);
        }

        let requeued = self.writer.schedule_reconnect_retries(self.retry.max_retries(), None);
        if requeued.is_empty() {
            return Ok(None);
        }
        info!(files = requeued.len(), "resuming uploads after reconnect");
        self.execute_pass(requeued).await.map(Some)
    }

    /// 监听网络恢复并自动调用 [`resume_after_reconnect`](Self::resume_after_reconnect)
    ///
    /// 编排器释放后任务自动退出；正在运行的处理轮次会自己接手重连。
    pub fn spawn_reconnect_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        let mut network = self.monitor.subscribe();

        tokio::spawn(async move {
            while network.changed().await.is_ok() {
                if !network.borrow_and_update().is_online() {
                    continue;
                }
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                match orchestrator.resume_after_reconnect().await {
                    Ok(Some(results)) => {
                        info!(succeeded = results.succeeded, failed = results.failed, "reconnect pass finished")
                    }
                    Ok(None) => {}
                    Err(UploadError::AlreadyRunning) => debug!("active pass handles reconnect"),
                    Err(e) => warn!("reconnect pass failed: {}", e),
                }
            }
        })
    }

    /// 取消当前轮次，可重复调用
    pub fn cancel(&self) {
        let token = self.pass_token.lock().clone();
        if !token.is_cancelled() {
            info!("cancelling upload pass");
            token.cancel();
        }
    }

    pub fn snapshot(&self) -> Vec<UploadRecord> {
        self.writer.read().records().to_vec()
    }

    pub fn record(&self, id: &UploadId) -> Option<UploadRecord> {
        self.writer.read().get(id).cloned()
    }

    pub fn counts(&self) -> StatusCounts {
        self.writer.read().counts()
    }

    pub fn reader(&self) -> StoreReader {
        self.writer.reader()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    /// 聚合进度，处理期间按固定间隔刷新
    pub fn session(&self) -> watch::Receiver<Option<UploadSession>> {
        self.session_tx.subscribe()
    }

    /// 当前注册目标；首次注册成功后会切换为已创建的容器
    pub fn target(&self) -> Option<ContainerTarget> {
        self.target.lock().clone()
    }

    async fn execute_pass(&self, ids: Vec<UploadId>) -> Result<UploadResults, UploadError> {
        let token = CancellationToken::new();
        *self.pass_token.lock() = token.clone();

        let started = Instant::now();
        let aggregator = self.aggregator.start(self.writer.reader(), Arc::clone(&self.session_tx));
        let outcome = self.process(ids, &token).await;
        aggregator.shutdown().await;
        let succeeded = outcome?;

        let registration = if token.is_cancelled() {
            info!("pass cancelled, registration skipped");
            RegistrationOutcome::NotAttempted
        } else if succeeded.is_empty() {
            RegistrationOutcome::NotAttempted
        } else {
            self.register(&succeeded, &token).await
        };

        let results = self.results(registration);
        let succeeded: HashSet<UploadId> = succeeded.into_iter().collect();
        let bytes: u64 = self
            .writer
            .read()
            .records()
            .iter()
            .filter(|r| succeeded.contains(&r.id))
            .map(|r| r.size())
            .sum();
        info!(
            succeeded = results.succeeded,
            failed = results.failed,
            cancelled = results.cancelled,
            pending = results.pending,
            "upload pass finished: {} in {}",
            format_bytes(bytes),
            format_duration(started.elapsed())
        );
        Ok(results)
    }

    async fn process(&self, ids: Vec<UploadId>, token: &CancellationToken) -> Result<Vec<UploadId>, UploadError> {
        let mut network = self.monitor.subscribe();
        let pass: HashSet<UploadId> = ids.iter().copied().collect();
        let chunk_size = self.profile.chunk_size.max(1);
        let mut chunks: VecDeque<Vec<UploadId>> = ids.chunks(chunk_size).map(<[UploadId]>::to_vec).collect();
        let mut succeeded = Vec::new();
        let mut index = 0usize;

        loop {
            if token.is_cancelled() {
                break;
            }

            let Some(chunk) = chunks.pop_front() else {
                // 所有分块已处理，离线时等待重连以完成剩余重试
                let waiting = !self.monitor.current().is_online()
                    && self.writer.read().has_reconnect_candidates(self.retry.max_retries(), Some(&pass));
                if waiting && !self.wait_until_online(&mut network, token).await {
                    break;
                }
                let requeued = self.take_reconnect(&pass);
                if requeued.is_empty() {
                    break;
                }
                succeeded.extend(self.scheduler(&mut network, &pass, token).drain(requeued).await);
                continue;
            };

            if !self.wait_until_online(&mut network, token).await {
                break;
            }

            let mut ready = self.take_reconnect(&pass);
            match self.prepare_chunk(&chunk, token).await {
                Ok(prepared) => ready.extend(prepared),
                Err(e) if index == 0 && e.class() == ErrorClass::Network => {
                    error!("failed to acquire upload urls for first chunk: {}", e);
                    return Err(UploadError::BackendUnreachable(e));
                }
                Err(e) => {
                    warn!(chunk = index, files = chunk.len(), "failed to acquire upload urls, chunk left pending: {}", e);
                    let _ = self.event_tx.send(UploadEvent::ChunkFailed {
                        chunk: index,
                        error: e.to_string(),
                    });
                }
            }
            index += 1;

            if !ready.is_empty() {
                succeeded.extend(self.scheduler(&mut network, &pass, token).drain(ready).await);
            }
        }

        if token.is_cancelled() {
            let cancelled = self.writer.cancel_unfinished(self.retry.max_retries(), Some(&pass));
            info!(cancelled, "unfinished uploads cancelled");
        }
        Ok(succeeded)
    }

    fn scheduler<'a>(
        &'a self,
        network: &'a mut watch::Receiver<Connectivity>,
        pass: &'a HashSet<UploadId>,
        token: &'a CancellationToken,
    ) -> ChunkScheduler<'a> {
        ChunkScheduler {
            writer: &self.writer,
            executor: &self.executor,
            retry: &self.retry,
            monitor: &self.monitor,
            network,
            pass,
            token,
            max_concurrent: self.profile.max_concurrent.max(1),
        }
    }

    /// 为分块中还没有上传地址的记录申请地址，返回可以开始传输的记录
    async fn prepare_chunk(&self, chunk: &[UploadId], token: &CancellationToken) -> Result<Vec<UploadId>, TransferError> {
        let (mut ready, missing) = {
            let store = self.writer.read();
            let mut ready = Vec::new();
            let mut missing = Vec::new();
            for record in chunk.iter().filter_map(|id| store.get(id)) {
                if !matches!(record.status, UploadStatus::Pending | UploadStatus::Retrying) {
                    continue;
                }
                if record.destination.is_some() {
                    ready.push(record.id);
                } else {
                    missing.push(record.clone());
                }
            }
            (ready, missing)
        };
        if missing.is_empty() {
            return Ok(ready);
        }

        let mut destinations = tokio::select! {
            acquired = self.destinations.acquire_destinations(&missing) => acquired?,
            _ = token.cancelled() => return Ok(ready),
        };
        for record in &missing {
            if let Some(destination) = destinations.remove(&record.id) {
                self.writer.assign_destination(&record.id, destination);
                ready.push(record.id);
            }
        }
        debug!(requested = missing.len(), ready = ready.len(), "chunk prepared");
        Ok(ready)
    }

    /// 离线时阻塞到网络恢复；取消时返回 false
    async fn wait_until_online(&self, network: &mut watch::Receiver<Connectivity>, token: &CancellationToken) -> bool {
        let mut announced = false;
        loop {
            if network.borrow_and_update().is_online() {
                return true;
            }
            if !announced {
                info!("offline, waiting for connectivity");
                announced = true;
            }
            tokio::select! {
                changed = network.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = token.cancelled() => return false,
            }
        }
    }

    fn take_reconnect(&self, pass: &HashSet<UploadId>) -> Vec<UploadId> {
        if !self.monitor.current().is_online() {
            return Vec::new();
        }
        self.writer.schedule_reconnect_retries(self.retry.max_retries(), Some(pass))
    }

    async fn register(&self, ids: &[UploadId], token: &CancellationToken) -> RegistrationOutcome {
        let Some(target) = self.target.lock().clone() else {
            return RegistrationOutcome::NotAttempted;
        };
        let records: Vec<UploadRecord> = {
            let store = self.writer.read();
            ids.iter()
                .filter_map(|id| store.get(id))
                .filter(|r| r.status == UploadStatus::Success)
                .cloned()
                .collect()
        };

        let committed = tokio::select! {
            committed = self.registrar.commit(&target, &records) => committed,
            _ = token.cancelled() => {
                warn!("registration interrupted by cancellation");
                return RegistrationOutcome::Failed(TransferError::Cancelled.to_string());
            }
        };

        match committed {
            Ok(report) => {
                // 后续轮次写入同一个容器
                *self.target.lock() = Some(ContainerTarget::Existing { id: report.container });
                let _ = self.event_tx.send(UploadEvent::Registered(report.clone()));
                RegistrationOutcome::Committed(report)
            }
            Err(e) => {
                error!("registration failed: {}", e);
                RegistrationOutcome::Failed(e.to_string())
            }
        }
    }

    fn results(&self, registration: RegistrationOutcome) -> UploadResults {
        let store = self.writer.read();
        let counts = store.counts();
        let storage_keys = store
            .records()
            .iter()
            .filter(|r| r.status == UploadStatus::Success)
            .filter_map(|r| r.storage_key().map(str::to_string))
            .collect();

        UploadResults {
            succeeded: counts.success,
            failed: counts.error,
            cancelled: counts.cancelled,
            skipped: counts.skipped,
            pending: counts.pending,
            storage_keys,
            registration,
        }
    }
}

/// [`UploadOrchestrator`] 构造器
pub struct OrchestratorBuilder {
    profile: UploadProfile,
    destinations: Option<Arc<dyn DestinationProvider>>,
    executor: Option<Arc<dyn TransferExecutor>>,
    registry: Option<(Arc<dyn RegistryBackend>, String)>,
    monitor: Option<Arc<NetworkMonitor>>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            profile: UploadProfile::default(),
            destinations: None,
            executor: None,
            registry: None,
            monitor: None,
        }
    }

    pub fn profile(mut self, profile: UploadProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn destinations(mut self, provider: Arc<dyn DestinationProvider>) -> Self {
        self.destinations = Some(provider);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TransferExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// `storage_base_url` 用于拼接注册时的 storageUrl
    pub fn registry(mut self, backend: Arc<dyn RegistryBackend>, storage_base_url: impl Into<String>) -> Self {
        self.registry = Some((backend, storage_base_url.into()));
        self
    }

    /// 未设置时使用始终在线的监视器
    pub fn network(mut self, monitor: Arc<NetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> Result<UploadOrchestrator, UploadError> {
        self.profile.validate()?;
        let destinations = self.destinations.ok_or(UploadError::MissingComponent("destination provider"))?;
        let executor = self.executor.ok_or(UploadError::MissingComponent("transfer executor"))?;
        let (backend, storage_base_url) = self.registry.ok_or(UploadError::MissingComponent("registry backend"))?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (session_tx, _) = watch::channel(None);

        Ok(UploadOrchestrator {
            registrar: BatchRegistrar::new(backend, storage_base_url).with_confirmation(self.profile.confirm_uploads),
            retry: RetryCoordinator::new(self.profile.retry.clone()),
            aggregator: ProgressAggregator::new(self.profile.progress_interval),
            monitor: self.monitor.unwrap_or_default(),
            writer: StoreWriter::new(event_tx.clone()),
            target: Mutex::new(None),
            pass_token: Mutex::new(CancellationToken::new()),
            run_lock: tokio::sync::Mutex::new(()),
            session_tx: Arc::new(session_tx),
            event_tx,
            destinations,
            executor,
            profile: self.profile,
        })
    }
}
