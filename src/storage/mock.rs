// 测试用存储服务
//
// 分片地址格式为 https://mock/part/{n}，ETag 为 "etag-{n}-{第几次请求}"

use crate::error::{Result, UploadError};
use crate::storage::{
    CompleteMultipartRequest, DirectUpload, InitiateMultipartRequest, MultipartSession,
    PartReceipt, PresignedPart, ProgressFn, StorageClient, StorageReply,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 分片请求回调（用于在上传过程中切换网络状态等）
pub type PartHook = Arc<dyn Fn(u32, usize) + Send + Sync>;

#[derive(Default)]
struct MockState {
    initiate_requests: Vec<InitiateMultipartRequest>,
    complete_requests: Vec<CompleteMultipartRequest>,
    form_uploads: Vec<DirectUpload>,
    /// 每个分片的请求次数
    part_attempts: HashMap<u32, usize>,
    /// 按顺序记录的分片请求
    part_log: Vec<u32>,
    /// 预设的分片失败（按顺序消费）
    part_failures: HashMap<u32, VecDeque<UploadError>>,
    initiate_failure: Option<UploadError>,
    complete_reply: Option<StorageReply>,
    form_reply: Option<StorageReply>,
    /// 单个分片的请求延迟（覆盖 part_delay）
    part_delays: HashMap<u32, Duration>,
}

/// 记录调用的存储服务
pub struct MockStorage {
    state: Mutex<MockState>,
    part_delay: Mutex<Duration>,
    initiate_delay: Mutex<Duration>,
    on_part: Mutex<Option<PartHook>>,
    active_parts: AtomicUsize,
    max_active_parts: AtomicUsize,
}

impl MockStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            part_delay: Mutex::new(Duration::from_millis(5)),
            initiate_delay: Mutex::new(Duration::ZERO),
            on_part: Mutex::new(None),
            active_parts: AtomicUsize::new(0),
            max_active_parts: AtomicUsize::new(0),
        })
    }

    pub fn part_url(part_number: u32) -> String {
        format!("https://mock/part/{}", part_number)
    }

    fn parse_part_number(url: &str) -> Result<u32> {
        url.rsplit('/')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| UploadError::Transport(format!("无效的分片地址: {}", url)))
    }

    /// 预设分片失败（可多次调用，按顺序生效）
    pub fn fail_part(&self, part_number: u32, error: UploadError) {
        self.state
            .lock()
            .part_failures
            .entry(part_number)
            .or_default()
            .push_back(error);
    }

    pub fn fail_initiate(&self, error: UploadError) {
        self.state.lock().initiate_failure = Some(error);
    }

    pub fn set_complete_reply(&self, reply: StorageReply) {
        self.state.lock().complete_reply = Some(reply);
    }

    pub fn set_form_reply(&self, reply: StorageReply) {
        self.state.lock().form_reply = Some(reply);
    }

    pub fn set_part_delay(&self, delay: Duration) {
        *self.part_delay.lock() = delay;
    }

    /// 设置单个分片的请求延迟
    pub fn set_part_delay_for(&self, part_number: u32, delay: Duration) {
        self.state.lock().part_delays.insert(part_number, delay);
    }

    pub fn set_initiate_delay(&self, delay: Duration) {
        *self.initiate_delay.lock() = delay;
    }

    pub fn on_part(&self, hook: PartHook) {
        *self.on_part.lock() = Some(hook);
    }

    pub fn initiate_requests(&self) -> Vec<InitiateMultipartRequest> {
        self.state.lock().initiate_requests.clone()
    }

    pub fn complete_requests(&self) -> Vec<CompleteMultipartRequest> {
        self.state.lock().complete_requests.clone()
    }

    pub fn form_uploads(&self) -> Vec<DirectUpload> {
        self.state.lock().form_uploads.clone()
    }

    pub fn part_attempts(&self, part_number: u32) -> usize {
        self.state
            .lock()
            .part_attempts
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    pub fn part_log(&self) -> Vec<u32> {
        self.state.lock().part_log.clone()
    }

    /// 当前仍在进行中的分片请求数
    pub fn active_parts(&self) -> usize {
        self.active_parts.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_parts(&self) -> usize {
        self.max_active_parts.load(Ordering::SeqCst)
    }
}

/// 分片请求进行中计数
struct ActivePart<'a>(&'a AtomicUsize);

impl Drop for ActivePart<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageClient for MockStorage {
    async fn initiate_multipart(
        &self,
        request: &InitiateMultipartRequest,
        _headers: &BTreeMap<String, String>,
    ) -> Result<MultipartSession> {
        let delay = *self.initiate_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.initiate_requests.push(request.clone());
        if let Some(error) = state.initiate_failure.take() {
            return Err(error);
        }

        Ok(MultipartSession {
            upload_id: Some("mock-upload".to_string()),
            key_to_save: format!("mock-{}", request.file_name),
            presigned_urls: request
                .parts
                .iter()
                .map(|p| PresignedPart {
                    part_number: p.part_number,
                    url: Self::part_url(p.part_number),
                })
                .collect(),
        })
    }

    async fn upload_part(
        &self,
        url: &str,
        data: Vec<u8>,
        on_progress: ProgressFn,
    ) -> Result<PartReceipt> {
        let part_number = Self::parse_part_number(url)?;

        let current = self.active_parts.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_parts.fetch_max(current, Ordering::SeqCst);
        let _active = ActivePart(&self.active_parts);

        let (attempt, failure, part_delay) = {
            let mut state = self.state.lock();
            state.part_log.push(part_number);
            let attempt = {
                let counter = state.part_attempts.entry(part_number).or_insert(0);
                *counter += 1;
                *counter
            };
            let failure = state
                .part_failures
                .get_mut(&part_number)
                .and_then(|queue| queue.pop_front());
            let part_delay = state.part_delays.get(&part_number).copied();
            (attempt, failure, part_delay)
        };

        let hook = self.on_part.lock().clone();
        if let Some(hook) = hook {
            hook(part_number, attempt);
        }

        let total = data.len() as u64;
        on_progress(total / 2, total);

        let delay = part_delay.unwrap_or_else(|| *self.part_delay.lock());
        tokio::time::sleep(delay).await;

        if let Some(error) = failure {
            return Err(error);
        }

        on_progress(total, total);

        Ok(PartReceipt {
            etag: format!("etag-{}-{}", part_number, attempt),
            checksum: None,
        })
    }

    async fn complete_multipart(
        &self,
        request: &CompleteMultipartRequest,
        _headers: &BTreeMap<String, String>,
    ) -> Result<StorageReply> {
        let mut state = self.state.lock();
        state.complete_requests.push(request.clone());
        Ok(state.complete_reply.clone().unwrap_or_else(|| StorageReply {
            status: 200,
            body: format!(
                r#"{{"message":"Upload complete","location":"s3://mock/{}"}}"#,
                request.key_to_save
            ),
        }))
    }

    async fn upload_form(
        &self,
        upload: DirectUpload,
        on_progress: ProgressFn,
    ) -> Result<StorageReply> {
        let total = upload.data.len() as u64;
        on_progress(total / 2, total);

        let delay = *self.part_delay.lock();
        tokio::time::sleep(delay).await;

        on_progress(total, total);

        let mut state = self.state.lock();
        state.form_uploads.push(upload);
        Ok(state.form_reply.clone().unwrap_or_else(|| StorageReply {
            status: 200,
            body: r#"{"message":"File uploaded successfully"}"#.to_string(),
        }))
    }
}
