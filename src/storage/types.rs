// 存储服务协议类型定义

use serde::{Deserialize, Deserializer, Serialize};

// =====================================================
// 创建分片上传会话
// =====================================================

/// 分片声明（创建会话时提交）
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PartDeclaration {
    pub part_number: u32,
    pub checksum_sha256: String,
}

/// 创建分片上传会话请求
#[derive(Debug, Clone, Serialize)]
pub struct InitiateMultipartRequest {
    pub file_name: String,
    pub file_size: u64,
    pub parts: Vec<PartDeclaration>,
}

/// 分片预签名上传地址
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PresignedPart {
    /// 服务端可能以数字或字符串返回
    #[serde(deserialize_with = "deserialize_part_number")]
    pub part_number: u32,
    pub url: String,
}

/// 分片上传会话
#[derive(Debug, Clone, Deserialize)]
pub struct MultipartSession {
    #[serde(default)]
    pub upload_id: Option<String>,
    pub key_to_save: String,
    #[serde(default)]
    pub presigned_urls: Vec<PresignedPart>,
}

impl MultipartSession {
    /// 按分片编号查找上传地址
    pub fn url_for(&self, part_number: u32) -> Option<&str> {
        self.presigned_urls
            .iter()
            .find(|p| p.part_number == part_number)
            .map(|p| p.url.as_str())
    }
}

/// 分片编号兼容数字和字符串两种格式
fn deserialize_part_number<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u32),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("无效的分片编号: {}", s))),
    }
}

// =====================================================
// 分片上传 / 合并
// =====================================================

/// 单个分片上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    /// ETag（已去除引号）
    pub etag: String,
    /// 服务端回传的校验和（可能缺失）
    pub checksum: Option<String>,
}

/// 已完成分片（合并请求）
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub checksum_sha256: String,
}

/// 合并分片请求
#[derive(Debug, Clone, Serialize)]
pub struct CompleteMultipartRequest {
    pub key_to_save: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub parts: Vec<CompletedPart>,
}

/// 服务端最终响应（状态码 + 原文）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageReply {
    pub status: u16,
    pub body: String,
}

impl StorageReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 去除 ETag 两侧的引号
pub fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}
