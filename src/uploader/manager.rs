// 上传管理器
//
// 负责管理多个上传任务：
// - 任务队列管理（FIFO 准入）
// - 准入策略（串行 / 并行）
// - 为每个任务绑定上传策略（分片上传 / 表单直传）
// - 将策略事件转发到事件总线
// - 取消 / 清理 / 状态查询
//
// 任务在任意时刻只存在于五个集合之一：pending / progress / done / error / abort

use crate::config::{AdmissionPolicy, UploadConfig};
use crate::error::{Result, UploadError};
use crate::events::{EventKind, GlobalEvent, JobEvent, NotificationBus, Subscription};
use crate::storage::StorageClient;
use crate::uploader::strategy::{StrategyEvent, StrategyOutcome, UploadStrategy};
use crate::uploader::{
    Connectivity, JobStatus, MultipartSettings, MultipartUpload, SingleUpload, UploadJob,
    UploadRequest,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// 管理器参数
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// 最大同时上传文件数
    pub max_uploads: usize,
    /// 准入策略
    pub admission: AdmissionPolicy,
    /// 分片上传参数
    pub multipart: MultipartSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_uploads: 100,
            admission: AdmissionPolicy::Serial,
            multipart: MultipartSettings::default(),
        }
    }
}

impl From<&UploadConfig> for ManagerSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_uploads: config.max_uploads.max(1),
            admission: config.admission,
            multipart: MultipartSettings::from(config),
        }
    }
}

/// 五个集合的快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub pending: Vec<UploadJob>,
    pub progress: Vec<UploadJob>,
    pub done: Vec<UploadJob>,
    pub error: Vec<UploadJob>,
    pub abort: Vec<UploadJob>,
}

impl StatusSnapshot {
    /// 快照中的任务总数
    pub fn len(&self) -> usize {
        self.pending.len() + self.progress.len() + self.done.len() + self.error.len() + self.abort.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 上传中的任务
struct ActiveJob {
    job: UploadJob,
    strategy: Arc<dyn UploadStrategy>,
    /// 启动序号，用于识别过期的策略回报
    run_id: u64,
}

#[derive(Default)]
struct ManagerState {
    pending: VecDeque<UploadJob>,
    progress: Vec<ActiveJob>,
    done: Vec<UploadJob>,
    error: Vec<UploadJob>,
    abort: Vec<UploadJob>,
    /// 任务结束等待者
    waiters: HashMap<String, Vec<oneshot::Sender<UploadJob>>>,
    /// 已取消但策略尚未结束的启动序号（仍占用准入名额）
    settling: HashSet<u64>,
    next_run_id: u64,
}

impl ManagerState {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            pending: self.pending.iter().cloned().collect(),
            progress: self.progress.iter().map(|a| a.job.clone()).collect(),
            done: self.done.clone(),
            error: self.error.clone(),
            abort: self.abort.clone(),
        }
    }

    /// 占用准入名额的任务数
    fn admitted(&self) -> usize {
        self.progress.len() + self.settling.len()
    }

    fn is_active(&self, id: &str) -> bool {
        self.pending.iter().any(|j| j.id == id) || self.progress.iter().any(|a| a.job.id == id)
    }

    fn active_jobs(&self) -> impl Iterator<Item = &UploadJob> {
        self.pending
            .iter()
            .chain(self.progress.iter().map(|a| &a.job))
    }

    fn find(&self, id: &str) -> Option<&UploadJob> {
        self.pending
            .iter()
            .chain(self.error.iter())
            .chain(self.abort.iter())
            .chain(self.done.iter())
            .chain(self.progress.iter().map(|a| &a.job))
            .find(|j| j.id == id)
    }
}

struct Inner {
    state: Mutex<ManagerState>,
    bus: Arc<NotificationBus>,
    storage: Arc<dyn StorageClient>,
    connectivity: Connectivity,
    settings: ManagerSettings,
}

/// 上传管理器
///
/// 克隆得到的句柄共享同一组任务集合和事件总线
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    /// 创建上传管理器
    ///
    /// # 参数
    /// * `settings` - 管理器参数
    /// * `storage` - 存储服务客户端
    /// * `connectivity` - 网络状态源（分片上传据此暂停/恢复）
    pub fn new(
        settings: ManagerSettings,
        storage: Arc<dyn StorageClient>,
        connectivity: Connectivity,
    ) -> Self {
        info!(
            "创建上传管理器: max_uploads={}, admission={:?}, 分片并发={}, 最大重试={}",
            settings.max_uploads,
            settings.admission,
            settings.multipart.concurrency,
            settings.multipart.max_retries
        );

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ManagerState::default()),
                bus: NotificationBus::new(),
                storage,
                connectivity,
                settings,
            }),
        }
    }

    /// 创建上传管理器（从配置读取参数）
    pub fn from_config(
        config: &UploadConfig,
        storage: Arc<dyn StorageClient>,
        connectivity: Connectivity,
    ) -> Self {
        Self::new(ManagerSettings::from(config), storage, connectivity)
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    // ==================== 订阅 ====================

    /// 订阅单个任务的事件（任务结束后订阅自动关闭）
    pub fn subscribe_job(&self, job_id: &str) -> Subscription<JobEvent> {
        self.inner.bus.subscribe_job(job_id)
    }

    /// 订阅所有任务的事件
    pub fn subscribe_all(&self) -> Subscription<GlobalEvent> {
        self.inner.bus.subscribe_all()
    }

    /// 等待任务结束
    ///
    /// 仅对等待中/上传中的任务有效，任务不存在或已结束时返回 None
    pub fn wait_for(&self, job_id: &str) -> Option<oneshot::Receiver<UploadJob>> {
        let mut state = self.inner.state.lock();
        if !state.is_active(job_id) {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        state
            .waiters
            .entry(job_id.to_string())
            .or_default()
            .push(tx);
        Some(rx)
    }

    // ==================== 提交与调度 ====================

    /// 提交上传任务
    ///
    /// 参数不完整时返回 BadRequest，任务不会入队。任务 ID 由调用方保证唯一
    pub fn submit(&self, request: UploadRequest) -> Result<String> {
        request.validate()?;

        let job = UploadJob::new(request);
        let id = job.id.clone();

        info!(
            "提交上传任务: id={}, origin={}, file={}, size={}, multipart={}",
            job.id,
            job.origin,
            job.file_name(),
            job.request.file.size,
            job.request.multipart
        );

        let mut state = self.inner.state.lock();
        state.pending.push_back(job.clone());
        self.emit(&state, EventKind::Pending, &job);
        self.admit_next(&mut state);

        Ok(id)
    }

    /// 按准入策略启动等待中的任务
    fn admit_next(&self, state: &mut ManagerState) {
        loop {
            let admissible = match self.inner.settings.admission {
                AdmissionPolicy::Serial => state.admitted() == 0,
                AdmissionPolicy::Parallel => state.admitted() < self.inner.settings.max_uploads,
            };
            if !admissible {
                break;
            }

            let Some(job) = state.pending.pop_front() else {
                break;
            };
            self.start_upload(state, job);
        }
    }

    /// 绑定上传策略并启动
    fn start_upload(&self, state: &mut ManagerState, mut job: UploadJob) {
        job.mark_in_progress();

        let strategy: Arc<dyn UploadStrategy> = if job.request.multipart {
            Arc::new(MultipartUpload::new(
                job.request.clone(),
                self.inner.storage.clone(),
                self.inner.settings.multipart,
                self.inner.connectivity.clone(),
            ))
        } else {
            Arc::new(SingleUpload::new(
                job.request.clone(),
                self.inner.storage.clone(),
            ))
        };

        state.next_run_id += 1;
        let run_id = state.next_run_id;

        state.progress.push(ActiveJob {
            job: job.clone(),
            strategy: strategy.clone(),
            run_id,
        });

        info!(
            "开始上传: id={}, 策略={}, 上传中={}, 等待中={}",
            job.id,
            if job.request.multipart { "分片上传" } else { "表单直传" },
            state.progress.len(),
            state.pending.len()
        );
        self.emit(state, EventKind::Start, &job);

        let manager = self.clone();
        let id = job.id;
        tokio::spawn(async move {
            manager.drive(id, run_id, strategy).await;
        });
    }

    /// 运行策略并转发事件
    async fn drive(&self, id: String, run_id: u64, strategy: Arc<dyn UploadStrategy>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let upload = strategy.upload(tx);
        tokio::pin!(upload);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => self.on_strategy_event(&id, run_id, event),
                outcome = &mut upload => break outcome,
            }
        };

        // 策略结束前发出的事件先于终态事件处理
        while let Ok(event) = rx.try_recv() {
            self.on_strategy_event(&id, run_id, event);
        }

        self.on_strategy_outcome(&id, run_id, outcome);
    }

    fn on_strategy_event(&self, id: &str, run_id: u64, event: StrategyEvent) {
        let mut state = self.inner.state.lock();

        // 任务已取消或已结束时忽略
        let Some(active) = state
            .progress
            .iter_mut()
            .find(|a| a.job.id == id && a.run_id == run_id)
        else {
            return;
        };

        let kind = match event {
            StrategyEvent::Prepare => {
                active.job.mark_preparing();
                EventKind::Prepare
            }
            StrategyEvent::Progress { loaded, total } => {
                let progress = if total == 0 {
                    0
                } else {
                    (loaded as f64 * 100.0 / total as f64).round() as i32
                }
                .clamp(0, 100);

                if progress == active.job.progress {
                    return;
                }
                active.job.progress = progress;
                EventKind::Progress
            }
            StrategyEvent::Online => EventKind::Online,
            StrategyEvent::Offline => EventKind::Offline,
        };

        let job = active.job.clone();
        self.emit(&state, kind, &job);
    }

    fn on_strategy_outcome(&self, id: &str, run_id: u64, outcome: StrategyOutcome) {
        let mut state = self.inner.state.lock();

        let Some(index) = state
            .progress
            .iter()
            .position(|a| a.job.id == id && a.run_id == run_id)
        else {
            // 已取消的任务在策略结束后才释放准入名额
            if state.settling.remove(&run_id) {
                debug!("已取消任务的策略已结束: id={}, run_id={}", id, run_id);
                self.admit_next(&mut state);
            } else {
                debug!("任务已不在上传中，忽略策略结果: id={}", id);
            }
            return;
        };
        let mut job = state.progress.remove(index).job;

        let kind = match outcome {
            StrategyOutcome::Finished(reply) if reply.is_success() => {
                job.mark_complete(&reply);
                info!("上传完成: id={}, status={}", job.id, reply.status);
                EventKind::Done
            }
            StrategyOutcome::Finished(reply) => {
                let err = UploadError::HttpStatus {
                    status: reply.status,
                    body: reply.body.clone(),
                };
                error!("上传失败: id={}, 错误: {}", job.id, err);
                job.mark_error(err.to_string(), Some(&reply));
                EventKind::Error
            }
            StrategyOutcome::Failed(err) => {
                error!("上传失败: id={}, 错误: {}", job.id, err);
                job.mark_error(err.to_string(), None);
                EventKind::Error
            }
            StrategyOutcome::Aborted => {
                info!("上传已取消: id={}", job.id);
                job.mark_aborted();
                EventKind::Aborted
            }
        };

        self.finish(&mut state, job, kind);
    }

    /// 任务进入终态：归档、发布事件、关闭订阅、通知等待者、启动下一个任务
    fn finish(&self, state: &mut ManagerState, job: UploadJob, kind: EventKind) {
        match job.status {
            JobStatus::Complete => state.done.push(job.clone()),
            JobStatus::Error => state.error.push(job.clone()),
            JobStatus::Aborted => state.abort.push(job.clone()),
            JobStatus::Pending | JobStatus::InProgress => {
                warn!("任务未处于终态，跳过归档: id={}, status={:?}", job.id, job.status);
                return;
            }
        }

        self.emit(state, kind, &job);
        self.inner.bus.close_job(&job.id);

        if let Some(waiters) = state.waiters.remove(&job.id) {
            for waiter in waiters {
                let _ = waiter.send(job.clone());
            }
        }

        self.admit_next(state);
    }

    /// 发布任务事件和全局事件
    fn emit(&self, state: &ManagerState, kind: EventKind, job: &UploadJob) {
        self.inner.bus.publish_job(JobEvent {
            kind,
            job_id: job.id.clone(),
            progress: job.progress,
            job: job.clone(),
        });
        self.inner.bus.publish_global(GlobalEvent {
            kind,
            snapshot: state.snapshot(),
            job: job.clone(),
        });
    }

    // ==================== 取消与清理 ====================

    fn cancel_locked(&self, state: &mut ManagerState, job_id: &str) -> bool {
        if let Some(index) = state.pending.iter().position(|j| j.id == job_id) {
            if let Some(mut job) = state.pending.remove(index) {
                info!("取消等待中的任务: id={}", job_id);
                job.mark_aborted();
                self.finish(state, job, EventKind::Aborted);
                return true;
            }
        }

        if let Some(index) = state.progress.iter().position(|a| a.job.id == job_id) {
            let active = state.progress.remove(index);
            info!("取消上传中的任务: id={}, progress={}", job_id, active.job.progress);
            active.strategy.cancel();
            state.settling.insert(active.run_id);

            let mut job = active.job;
            job.mark_aborted();
            self.finish(state, job, EventKind::Aborted);
            return true;
        }

        false
    }

    /// 取消任务
    ///
    /// # 参数
    /// * `job_id` - 任务ID
    /// * `purge` - 是否同时从所有集合中移除
    ///
    /// 返回任务是否处于等待中/上传中
    pub fn cancel(&self, job_id: &str, purge: bool) -> bool {
        let mut state = self.inner.state.lock();
        let cancelled = self.cancel_locked(&mut state, job_id);
        if purge {
            self.clear_locked(&mut state, job_id);
        }
        cancelled
    }

    /// 取消所有等待中/上传中的任务（可按 origin 过滤）
    ///
    /// 返回取消的任务数
    pub fn cancel_all(&self, origin: Option<&str>) -> usize {
        let mut state = self.inner.state.lock();

        // 先取消等待中的任务，避免取消上传中任务时被重新准入
        let pending: Vec<String> = state
            .pending
            .iter()
            .filter(|j| origin.map_or(true, |o| j.origin == o))
            .map(|j| j.id.clone())
            .collect();
        let running: Vec<String> = state
            .progress
            .iter()
            .filter(|a| origin.map_or(true, |o| a.job.origin == o))
            .map(|a| a.job.id.clone())
            .collect();

        let mut count = 0;
        for id in pending.iter().chain(running.iter()) {
            if self.cancel_locked(&mut state, id) {
                count += 1;
            }
        }

        info!("批量取消任务: origin={:?}, 数量={}", origin, count);
        count
    }

    fn clear_locked(&self, state: &mut ManagerState, job_id: &str) {
        state.pending.retain(|j| j.id != job_id);
        if let Some(index) = state.progress.iter().position(|a| a.job.id == job_id) {
            let active = state.progress.remove(index);
            active.strategy.cancel();
            state.settling.insert(active.run_id);
        }
        state.done.retain(|j| j.id != job_id);
        state.error.retain(|j| j.id != job_id);
        state.abort.retain(|j| j.id != job_id);
        state.waiters.remove(job_id);
        self.inner.bus.close_job(job_id);
    }

    /// 从所有集合中移除任务（上传中的任务会被静默中止）
    pub fn clear(&self, job_id: &str) {
        let mut state = self.inner.state.lock();
        self.clear_locked(&mut state, job_id);
        debug!("已清除任务: id={}", job_id);
        self.admit_next(&mut state);
    }

    /// 清空所有集合（上传中的任务会被静默中止）
    pub fn clear_all(&self) {
        let mut state = self.inner.state.lock();

        let ids: Vec<String> = state
            .active_jobs()
            .chain(state.done.iter())
            .chain(state.error.iter())
            .chain(state.abort.iter())
            .map(|j| j.id.clone())
            .collect();
        for id in &ids {
            self.inner.bus.close_job(id);
        }

        let running: Vec<ActiveJob> = state.progress.drain(..).collect();
        for active in running {
            active.strategy.cancel();
            state.settling.insert(active.run_id);
        }
        state.pending.clear();
        state.done.clear();
        state.error.clear();
        state.abort.clear();
        state.waiters.clear();
        info!("已清空所有上传任务");
    }

    // ==================== 查询 ====================

    /// 查询单个任务
    pub fn query_status(&self, job_id: &str) -> Option<UploadJob> {
        self.inner.state.lock().find(job_id).cloned()
    }

    /// 查询所有集合
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.state.lock().snapshot()
    }

    /// 指定任务或指定 origin 是否有等待中/上传中的任务
    pub fn is_busy(&self, origin: &str, job_id: Option<&str>) -> bool {
        let state = self.inner.state.lock();
        match job_id {
            Some(id) => state.is_active(id),
            None => state.active_jobs().any(|j| j.origin == origin),
        }
    }

    /// 指定 origin 的等待中 + 上传中任务数
    pub fn upload_count(&self, origin: &str) -> usize {
        self.inner
            .state
            .lock()
            .active_jobs()
            .filter(|j| j.origin == origin)
            .count()
    }

    /// 是否没有等待中/上传中的任务
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.pending.is_empty() && state.progress.is_empty()
    }
}
