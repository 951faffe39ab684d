// 表单直传策略
//
// 整个文件作为一个 multipart/form-data 请求发送，不分片、不重试

use crate::storage::{DirectUpload, ProgressFn, StorageClient};
use crate::uploader::strategy::{emit, EventSink, StrategyEvent, StrategyOutcome, UploadStrategy};
use crate::uploader::UploadRequest;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 表单直传
pub struct SingleUpload {
    request: UploadRequest,
    storage: Arc<dyn StorageClient>,
    cancel_token: CancellationToken,
}

impl SingleUpload {
    pub fn new(request: UploadRequest, storage: Arc<dyn StorageClient>) -> Self {
        Self {
            request,
            storage,
            cancel_token: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl UploadStrategy for SingleUpload {
    async fn upload(&self, events: EventSink) -> StrategyOutcome {
        let request = &self.request;

        let data = tokio::select! {
            _ = self.cancel_token.cancelled() => return StrategyOutcome::Aborted,
            result = request.file.read_all() => match result {
                Ok(data) => data,
                Err(e) => return StrategyOutcome::Failed(e),
            },
        };

        let progress_events = events.clone();
        let on_progress: ProgressFn = Arc::new(move |loaded, total| {
            emit(&progress_events, StrategyEvent::Progress { loaded, total });
        });

        let upload = DirectUpload {
            url: request.url.clone(),
            method: request.method,
            headers: request.headers.clone(),
            file_field: request.file_field.clone(),
            file_name: request.file.name.clone(),
            data,
            form_fields: request.form_fields.clone(),
        };

        info!(
            "开始表单直传: id={}, file={}, size={}",
            request.id, request.file.name, request.file.size
        );

        tokio::select! {
            _ = self.cancel_token.cancelled() => {
                info!("表单直传已取消: id={}", request.id);
                StrategyOutcome::Aborted
            }
            result = self.storage.upload_form(upload, on_progress) => match result {
                Ok(reply) => StrategyOutcome::Finished(reply),
                Err(e) => {
                    warn!("表单直传失败: id={}, 错误: {}", request.id, e);
                    StrategyOutcome::Failed(e)
                }
            },
        }
    }

    fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

impl std::fmt::Debug for SingleUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleUpload")
            .field("id", &self.request.id)
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}
