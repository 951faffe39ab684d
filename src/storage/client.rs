// 存储服务 HTTP 客户端实现

use crate::config::StorageConfig;
use crate::error::{Result, UploadError};
use crate::storage::{
    normalize_etag, CompleteMultipartRequest, DirectUpload, InitiateMultipartRequest,
    MultipartSession, PartReceipt, ProgressFn, StorageClient, StorageReply,
};
use crate::uploader::UploadMethod;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{multipart, Body, Client, RequestBuilder};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 流式发送时每次提交的字节数
const STREAM_PIECE_SIZE: usize = 64 * 1024;

/// 分片校验和响应头
const CHECKSUM_HEADER: &str = "x-amz-checksum-sha256";

/// 存储服务客户端
#[derive(Debug, Clone)]
pub struct HttpStorageClient {
    client: Client,
    initiate_url: String,
    complete_url: String,
}

impl HttpStorageClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `config` - 存储端点配置
    /// * `request_timeout_secs` - 单次请求超时
    pub fn new(config: &StorageConfig, request_timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| UploadError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!(
            "初始化存储客户端: initiate={}, complete={}, timeout={}s",
            config.initiate_url(),
            config.complete_url(),
            request_timeout_secs
        );

        Ok(Self {
            client,
            initiate_url: config.initiate_url(),
            complete_url: config.complete_url(),
        })
    }

    fn apply_headers(builder: RequestBuilder, headers: &BTreeMap<String, String>) -> RequestBuilder {
        headers
            .iter()
            .fold(builder, |builder, (name, value)| builder.header(name, value))
    }

    /// 按固定大小切分数据，每提交一块回调一次进度
    fn progress_stream(
        data: Vec<u8>,
        on_progress: ProgressFn,
    ) -> impl futures::Stream<Item = std::io::Result<Vec<u8>>> + Send + Sync + 'static {
        let total = data.len() as u64;
        let pieces: Vec<Vec<u8>> = data
            .chunks(STREAM_PIECE_SIZE)
            .map(|piece| piece.to_vec())
            .collect();

        let mut sent = 0u64;
        futures::stream::iter(pieces).map(move |piece| {
            sent += piece.len() as u64;
            on_progress(sent, total);
            Ok(piece)
        })
    }

    /// 将数据包装为带进度回调的流式请求体
    fn progress_body(data: Vec<u8>, on_progress: ProgressFn) -> Body {
        Body::wrap_stream(Self::progress_stream(data, on_progress))
    }

    async fn into_reply(response: reqwest::Response) -> Result<StorageReply> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(StorageReply { status, body })
    }
}

#[async_trait]
impl StorageClient for HttpStorageClient {
    async fn initiate_multipart(
        &self,
        request: &InitiateMultipartRequest,
        headers: &BTreeMap<String, String>,
    ) -> Result<MultipartSession> {
        info!(
            "创建分片上传会话: file={}, size={}, parts={}",
            request.file_name,
            request.file_size,
            request.parts.len()
        );

        let builder = self
            .client
            .post(&self.initiate_url)
            .header(CONTENT_TYPE, "application/json");
        let response = Self::apply_headers(builder, headers)
            .json(request)
            .send()
            .await?;

        let reply = Self::into_reply(response).await?;
        debug!("创建会话响应: status={}, body={}", reply.status, reply.body);

        if !reply.is_success() {
            error!("创建分片上传会话失败: status={}", reply.status);
            return Err(UploadError::HttpStatus {
                status: reply.status,
                body: reply.body,
            });
        }

        let session: MultipartSession = serde_json::from_str(&reply.body)?;
        info!(
            "分片上传会话已创建: key={}, upload_id={:?}, urls={}",
            session.key_to_save,
            session.upload_id,
            session.presigned_urls.len()
        );
        Ok(session)
    }

    async fn upload_part(
        &self,
        url: &str,
        data: Vec<u8>,
        on_progress: ProgressFn,
    ) -> Result<PartReceipt> {
        let length = data.len() as u64;

        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, length)
            .body(Self::progress_body(data, on_progress))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("分片上传返回异常状态: status={}, body={}", status, body);
            return Err(UploadError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let headers = response.headers();
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(normalize_etag)
            .filter(|etag| !etag.is_empty())
            .ok_or_else(|| UploadError::Transport("分片上传响应缺少 ETag".to_string()))?;
        let checksum = headers
            .get(CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        debug!("分片上传成功: etag={}, size={}", etag, length);

        Ok(PartReceipt { etag, checksum })
    }

    async fn complete_multipart(
        &self,
        request: &CompleteMultipartRequest,
        headers: &BTreeMap<String, String>,
    ) -> Result<StorageReply> {
        info!(
            "合并分片: key={}, parts={}",
            request.key_to_save,
            request.parts.len()
        );

        let builder = self
            .client
            .post(&self.complete_url)
            .header(CONTENT_TYPE, "application/json");
        let response = Self::apply_headers(builder, headers)
            .json(request)
            .send()
            .await?;

        let reply = Self::into_reply(response).await?;
        debug!("合并分片响应: status={}, body={}", reply.status, reply.body);
        Ok(reply)
    }

    async fn upload_form(
        &self,
        upload: DirectUpload,
        on_progress: ProgressFn,
    ) -> Result<StorageReply> {
        info!(
            "表单直传: url={}, file={}, size={}",
            upload.url,
            upload.file_name,
            upload.data.len()
        );

        let length = upload.data.len() as u64;
        let part = multipart::Part::stream_with_length(
            Self::progress_body(upload.data, on_progress),
            length,
        )
        .file_name(upload.file_name)
        .mime_str("application/octet-stream")?;

        // 文件字段在前，额外字段在后
        let form = upload.form_fields.into_iter().fold(
            multipart::Form::new().part(upload.file_field, part),
            |form, (name, value)| form.text(name, value),
        );

        let builder = match upload.method {
            UploadMethod::Post => self.client.post(&upload.url),
            UploadMethod::Put => self.client.put(&upload.url),
        };
        let response = Self::apply_headers(builder, &upload.headers)
            .multipart(form)
            .send()
            .await?;

        let reply = Self::into_reply(response).await?;
        debug!("表单直传响应: status={}, body={}", reply.status, reply.body);
        Ok(reply)
    }
}
