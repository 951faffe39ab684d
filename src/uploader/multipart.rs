// 分片上传策略
//
// 上传流程：
// 1. 准备：规划分片并按顺序计算每个分片的 SHA-256
// 2. 创建会话：提交分片列表，获取每个分片的预签名地址
// 3. 并发上传：工作队列 + 受限的进行中集合（默认 3 个）
//    - 失败的分片重新放回队首，优先于新分片
//    - 在线失败消耗重试次数，耗尽后任务失败并中止其余分片
//    - 离线失败不消耗重试次数，等待网络恢复后继续
// 4. 合并：按分片编号升序提交所有分片的 ETag

use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::storage::{
    CompleteMultipartRequest, InitiateMultipartRequest, PartDeclaration, PartReceipt, ProgressFn,
    StorageClient, StorageReply,
};
use crate::uploader::chunk::{
    completed_parts, describe_chunks, plan_chunks, retry_backoff_delay, ChunkDescriptor,
    ChunkRetryState, PartUploadRecord, DEFAULT_CHUNK_SIZE, MAX_CHUNKS,
};
use crate::uploader::strategy::{emit, EventSink, StrategyEvent, StrategyOutcome, UploadStrategy};
use crate::uploader::{Connectivity, UploadRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分片进度槽：连接尚未建立
const SLOT_IDLE: f64 = -1.0;

/// 分片上传参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartSettings {
    /// 期望分片大小
    pub chunk_size: u64,
    /// 单文件最大分片数
    pub max_chunks: u64,
    /// 单文件同时上传的分片数
    pub concurrency: usize,
    /// 在线失败的最大重试次数
    pub max_retries: u32,
    /// 重试初始退避（毫秒）
    pub retry_backoff_ms: u64,
}

impl Default for MultipartSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks: MAX_CHUNKS,
            concurrency: 3,
            max_retries: 1,
            retry_backoff_ms: 0,
        }
    }
}

impl From<&UploadConfig> for MultipartSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size_bytes(),
            max_chunks: config.max_chunks,
            concurrency: config.concurrent_chunks.max(1),
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }
}

/// 分片任务结果
type PartResult = (ChunkRetryState, Result<PartReceipt>);

/// 分片进度消息（下标, 派发序号, 百分比）
type SlotProgress = (usize, u64, f64);

/// 分片上传
pub struct MultipartUpload {
    request: UploadRequest,
    storage: Arc<dyn StorageClient>,
    settings: MultipartSettings,
    connectivity: Connectivity,
    cancel_token: CancellationToken,
    /// 进行中的分片连接：part_number -> AbortHandle
    connections: Arc<Mutex<HashMap<u32, AbortHandle>>>,
}

/// 分片调度状态（仅由调度循环持有）
struct TransferState {
    queue: VecDeque<ChunkRetryState>,
    slots: Vec<f64>,
    /// 每个分片最近一次派发的序号，用于丢弃过期的进度消息
    dispatch_seq: Vec<u64>,
    next_seq: u64,
    records: Vec<PartUploadRecord>,
}

impl TransferState {
    fn new(descriptors: &[ChunkDescriptor]) -> Self {
        Self {
            queue: descriptors
                .iter()
                .enumerate()
                .map(|(index, d)| ChunkRetryState::new(index, d.part_number))
                .collect(),
            slots: vec![SLOT_IDLE; descriptors.len()],
            dispatch_seq: vec![0; descriptors.len()],
            next_seq: 0,
            records: Vec::with_capacity(descriptors.len()),
        }
    }

    /// 上报总进度：所有槽位之和 / (分片数 × 100)
    fn report(&self, events: &EventSink) {
        let loaded: f64 = self.slots.iter().map(|p| p.max(0.0)).sum();
        emit(
            events,
            StrategyEvent::Progress {
                loaded: loaded.round() as u64,
                total: self.slots.len() as u64 * 100,
            },
        );
    }
}

impl MultipartUpload {
    pub fn new(
        request: UploadRequest,
        storage: Arc<dyn StorageClient>,
        settings: MultipartSettings,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            request,
            storage,
            settings,
            connectivity,
            cancel_token: CancellationToken::new(),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 当前进行中的分片连接数
    pub fn active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    fn abort_connections(&self) {
        let handles: Vec<AbortHandle> = self
            .connections
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.abort();
        }
    }

    async fn run(&self, events: &EventSink) -> Result<StorageReply> {
        let request = &self.request;
        let file = &request.file;

        // 1. 准备
        emit(events, StrategyEvent::Prepare);
        let plan = plan_chunks(file.size, self.settings.chunk_size, self.settings.max_chunks);
        let descriptors = tokio::select! {
            _ = self.cancel_token.cancelled() => return Err(UploadError::Aborted),
            result = describe_chunks(file, &plan) => result?,
        };

        // 2. 创建会话
        let initiate = InitiateMultipartRequest {
            file_name: file.name.clone(),
            file_size: file.size,
            parts: descriptors
                .iter()
                .map(|d| PartDeclaration {
                    part_number: d.part_number,
                    checksum_sha256: d.checksum.clone(),
                })
                .collect(),
        };
        let session = tokio::select! {
            _ = self.cancel_token.cancelled() => return Err(UploadError::Aborted),
            result = self.storage.initiate_multipart(&initiate, &request.headers) => result?,
        };

        // 响应返回时任务可能已被取消
        if self.cancel_token.is_cancelled() {
            info!("会话创建期间任务已取消，丢弃会话: id={}", request.id);
            return Err(UploadError::Aborted);
        }

        let urls = descriptors
            .iter()
            .map(|d| {
                session.url_for(d.part_number).map(str::to_string).ok_or_else(|| {
                    UploadError::Transport(format!("会话缺少分片 #{} 的上传地址", d.part_number))
                })
            })
            .collect::<Result<Vec<String>>>()?;

        // 3. 并发上传
        let records = self.transfer(&descriptors, &urls, events).await?;

        // 4. 合并
        let complete = CompleteMultipartRequest {
            key_to_save: session.key_to_save.clone(),
            upload_id: session.upload_id.clone(),
            parts: completed_parts(&records, descriptors.len())?,
        };

        info!(
            "所有分片上传完成，开始合并: id={}, key={}, parts={}",
            request.id,
            complete.key_to_save,
            complete.parts.len()
        );

        tokio::select! {
            _ = self.cancel_token.cancelled() => Err(UploadError::Aborted),
            result = self.storage.complete_multipart(&complete, &request.headers) => result,
        }
    }

    /// 同步网络状态，状态变化时上报
    fn sync_connectivity(
        &self,
        online_rx: &mut watch::Receiver<bool>,
        online: &mut bool,
        events: &EventSink,
    ) {
        let now = *online_rx.borrow_and_update();
        if now == *online {
            return;
        }
        *online = now;

        if now {
            info!("网络已恢复，继续上传分片: id={}", self.request.id);
            emit(events, StrategyEvent::Online);
        } else {
            warn!("网络已断开，暂停派发分片: id={}", self.request.id);
            emit(events, StrategyEvent::Offline);
        }
    }

    /// 派发一个分片上传任务
    fn dispatch(
        &self,
        in_flight: &mut JoinSet<PartResult>,
        attempt: ChunkRetryState,
        descriptor: &ChunkDescriptor,
        url: &str,
        seq: u64,
        progress_tx: &mpsc::UnboundedSender<SlotProgress>,
    ) {
        let storage = self.storage.clone();
        let file = self.request.file.clone();
        let range = descriptor.range();
        let url = url.to_string();
        let progress_tx = progress_tx.clone();
        let index = attempt.index;
        let part_number = attempt.part_number;
        let backoff_ms = retry_backoff_delay(attempt.retries, self.settings.retry_backoff_ms);

        debug!(
            "派发分片: id={}, part={}, retries={}, backoff={}ms",
            self.request.id, part_number, attempt.retries, backoff_ms
        );

        let handle = in_flight.spawn(async move {
            if backoff_ms > 0 {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }

            let result = async {
                let data = file.read_range(range).await?;
                let on_progress: ProgressFn = Arc::new(move |loaded, total| {
                    let pct = if total == 0 {
                        100.0
                    } else {
                        loaded as f64 * 100.0 / total as f64
                    };
                    let _ = progress_tx.send((index, seq, pct));
                });
                storage.upload_part(&url, data, on_progress).await
            }
            .await;

            (attempt, result)
        });

        self.connections.lock().insert(part_number, handle);
    }

    /// 并发上传所有分片
    async fn transfer(
        &self,
        descriptors: &[ChunkDescriptor],
        urls: &[String],
        events: &EventSink,
    ) -> Result<Vec<PartUploadRecord>> {
        let id = &self.request.id;
        let concurrency = self.settings.concurrency.max(1);
        let mut state = TransferState::new(descriptors);
        let mut in_flight: JoinSet<PartResult> = JoinSet::new();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<SlotProgress>();

        let mut online_rx = self.connectivity.subscribe();
        let mut online = *online_rx.borrow_and_update();
        let mut watching = true;

        info!(
            "开始上传分片: id={}, 分片数={}, 并发={}",
            id,
            descriptors.len(),
            concurrency
        );

        loop {
            self.sync_connectivity(&mut online_rx, &mut online, events);

            // 在线时补齐进行中的分片
            while online && in_flight.len() < concurrency {
                let Some(attempt) = state.queue.pop_front() else {
                    break;
                };
                let index = attempt.index;
                state.next_seq += 1;
                state.dispatch_seq[index] = state.next_seq;
                state.slots[index] = 0.0;
                self.dispatch(
                    &mut in_flight,
                    attempt,
                    &descriptors[index],
                    &urls[index],
                    state.next_seq,
                    &progress_tx,
                );
            }

            if state.queue.is_empty() && in_flight.is_empty() {
                if online {
                    break;
                }
                debug!("分片已全部上传，等待网络恢复后合并: id={}", id);
            }

            tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    in_flight.shutdown().await;
                    return Err(UploadError::Aborted);
                }

                Some((index, seq, pct)) = progress_rx.recv() => {
                    let slot = state.slots[index];
                    if state.dispatch_seq[index] == seq && (0.0..100.0).contains(&slot) {
                        state.slots[index] = pct.clamp(0.0, 100.0);
                        state.report(events);
                    }
                }

                changed = online_rx.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    }
                }

                Some(joined) = in_flight.join_next() => {
                    let (mut attempt, result) = match joined {
                        Ok(output) => output,
                        Err(e) if e.is_cancelled() && self.cancel_token.is_cancelled() => {
                            in_flight.shutdown().await;
                            return Err(UploadError::Aborted);
                        }
                        Err(e) => {
                            error!("分片任务异常: id={}, 错误: {}", id, e);
                            in_flight.shutdown().await;
                            self.abort_connections();
                            return Err(UploadError::Transport(format!("分片任务异常: {}", e)));
                        }
                    };

                    self.connections.lock().remove(&attempt.part_number);
                    let index = attempt.index;

                    match result {
                        Ok(receipt) => {
                            state.slots[index] = 100.0;
                            state.records.push(PartUploadRecord {
                                part_number: attempt.part_number,
                                etag: receipt.etag,
                                checksum: receipt
                                    .checksum
                                    .unwrap_or_else(|| descriptors[index].checksum.clone()),
                                retry_count: attempt.retries,
                            });
                            state.report(events);

                            debug!(
                                "[分片#{}] ✓ 上传成功 ({}/{} 完成): id={}",
                                attempt.part_number,
                                state.records.len(),
                                descriptors.len(),
                                id
                            );
                        }
                        Err(_) if self.cancel_token.is_cancelled() => {
                            in_flight.shutdown().await;
                            return Err(UploadError::Aborted);
                        }
                        Err(e) => {
                            state.slots[index] = SLOT_IDLE;

                            if !self.connectivity.is_online() {
                                // 离线失败不消耗重试次数
                                warn!(
                                    "[分片#{}] 离线期间上传失败，等待网络恢复: id={}, 错误: {}",
                                    attempt.part_number, id, e
                                );
                                attempt.defer_offline();
                                state.queue.push_front(attempt);
                            } else if e.is_retriable() && attempt.retries < self.settings.max_retries {
                                warn!(
                                    "[分片#{}] 上传失败，重新排队 ({}/{}): id={}, 错误: {}",
                                    attempt.part_number,
                                    attempt.retries + 1,
                                    self.settings.max_retries,
                                    id,
                                    e
                                );
                                attempt.record_retry(e);
                                state.queue.push_front(attempt);
                            } else {
                                error!(
                                    "[分片#{}] 上传失败，已达最大重试次数 ({}): id={}, 错误: {}, 上一次失败: {}",
                                    attempt.part_number,
                                    attempt.retries,
                                    id,
                                    e,
                                    attempt.last_error_message()
                                );
                                // 中止其余分片
                                self.abort_connections();
                                in_flight.shutdown().await;

                                if !e.is_retriable() {
                                    return Err(e);
                                }
                                return Err(UploadError::ChunkExhausted {
                                    part_number: attempt.part_number,
                                    retries: attempt.retries,
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok(state.records)
    }
}

#[async_trait]
impl UploadStrategy for MultipartUpload {
    async fn upload(&self, events: EventSink) -> StrategyOutcome {
        let result = self.run(&events).await;
        self.abort_connections();

        match result {
            Ok(reply) => StrategyOutcome::Finished(reply),
            // 取消优先于同时发生的错误
            Err(_) if self.cancel_token.is_cancelled() => StrategyOutcome::Aborted,
            Err(UploadError::Aborted) => StrategyOutcome::Aborted,
            Err(e) => {
                error!("分片上传失败: id={}, 错误: {}", self.request.id, e);
                StrategyOutcome::Failed(e)
            }
        }
    }

    fn cancel(&self) {
        self.cancel_token.cancel();
        self.abort_connections();
    }
}

impl std::fmt::Debug for MultipartUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartUpload")
            .field("id", &self.request.id)
            .field("settings", &self.settings)
            .field("active_connections", &self.active_connections())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}
