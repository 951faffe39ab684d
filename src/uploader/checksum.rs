// 分片校验和
//
// 每个分片计算 SHA-256，结果以标准 base64 编码（与存储服务的
// x-amz-checksum-sha256 格式一致）

use crate::error::{Result, UploadError};
use crate::uploader::UploadFile;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::ops::Range;

/// 计算数据的 SHA-256（base64 编码）
pub fn sha256_base64(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    STANDARD.encode(digest)
}

/// 计算文件指定字节范围的校验和
///
/// 读取和哈希都在阻塞线程池中完成，不占用调度线程
pub async fn checksum_range(file: &UploadFile, range: Range<u64>) -> Result<String> {
    let data = file.read_range(range).await?;

    tokio::task::spawn_blocking(move || sha256_base64(&data))
        .await
        .map_err(|e| UploadError::Transport(format!("计算校验和任务执行失败: {}", e)))
}
