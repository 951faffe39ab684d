// 存储服务模块
//
// 上传流程依赖的外部服务：
// - 创建分片上传会话（返回每个分片的预签名地址）
// - 按预签名地址上传分片（PUT 原始字节）
// - 合并分片
// - 小文件表单直传

pub mod client;
#[cfg(test)]
pub(crate) mod mock;
pub mod types;

pub use client::HttpStorageClient;
pub use types::*;

use crate::error::Result;
use crate::uploader::UploadMethod;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// 上传进度回调（已发送字节数, 总字节数）
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 表单直传参数
#[derive(Debug, Clone)]
pub struct DirectUpload {
    pub url: String,
    pub method: UploadMethod,
    pub headers: BTreeMap<String, String>,
    /// 文件字段名
    pub file_field: String,
    pub file_name: String,
    pub data: Vec<u8>,
    /// 额外表单字段
    pub form_fields: BTreeMap<String, String>,
}

/// 存储服务客户端
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// 创建分片上传会话
    async fn initiate_multipart(
        &self,
        request: &InitiateMultipartRequest,
        headers: &BTreeMap<String, String>,
    ) -> Result<MultipartSession>;

    /// 上传单个分片到预签名地址
    async fn upload_part(
        &self,
        url: &str,
        data: Vec<u8>,
        on_progress: ProgressFn,
    ) -> Result<PartReceipt>;

    /// 合并分片
    ///
    /// 服务端返回非 2xx 时仍返回 Ok，由调用方根据状态码判定
    async fn complete_multipart(
        &self,
        request: &CompleteMultipartRequest,
        headers: &BTreeMap<String, String>,
    ) -> Result<StorageReply>;

    /// 表单直传
    ///
    /// 服务端返回非 2xx 时仍返回 Ok，由调用方根据状态码判定
    async fn upload_form(&self, upload: DirectUpload, on_progress: ProgressFn)
        -> Result<StorageReply>;
}
