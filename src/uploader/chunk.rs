// 上传分片规划
//
// 分片规则：
// - 默认分片大小 5MB
// - 单文件最多 1000 个分片；超过时按 ceil(size / 1000) 重新计算分片大小
// - 分片编号从 1 开始，连续，覆盖整个文件且无重叠
// - 空文件规划为一个长度为 0 的分片（存储服务要求至少一个分片）

use crate::error::{Result, UploadError};
use crate::storage::CompletedPart;
use crate::uploader::checksum::checksum_range;
use crate::uploader::UploadFile;
use std::ops::Range;
use tracing::{debug, info};

/// 默认上传分片大小: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 单文件最大分片数
pub const MAX_CHUNKS: u64 = 1000;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 计算重试退避延迟
///
/// # 延迟序列（initial_ms=100）
/// - retry=1: 100ms
/// - retry=2: 200ms
/// - retry=3: 400ms
/// - 最大: 5000ms
///
/// initial_ms 为 0 时立即重试
pub fn retry_backoff_delay(retry: u32, initial_ms: u64) -> u64 {
    if initial_ms == 0 || retry == 0 {
        return 0;
    }
    let factor = 2u64.saturating_pow(retry - 1);
    initial_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
}

/// 分片范围（未计算校验和）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// 分片编号（从 1 开始）
    pub part_number: u32,
    /// 起始偏移
    pub start_offset: u64,
    /// 长度
    pub length: u64,
}

impl ChunkSpan {
    pub fn range(&self) -> Range<u64> {
        self.start_offset..self.start_offset + self.length
    }
}

/// 分片规划结果
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    /// 实际使用的分片大小
    pub chunk_size: u64,
    /// 所有分片
    pub spans: Vec<ChunkSpan>,
}

impl ChunkPlan {
    pub fn chunk_count(&self) -> usize {
        self.spans.len()
    }
}

/// 规划分片
///
/// # 参数
/// * `file_size` - 文件大小
/// * `chunk_size` - 期望分片大小
/// * `max_chunks` - 最大分片数
pub fn plan_chunks(file_size: u64, chunk_size: u64, max_chunks: u64) -> ChunkPlan {
    let max_chunks = max_chunks.max(1);
    let mut chunk_size = chunk_size.max(1);

    // 分片数超限时放大分片，只需重新计算一次
    if file_size.div_ceil(chunk_size) > max_chunks {
        chunk_size = file_size.div_ceil(max_chunks);
    }

    let mut spans = Vec::new();
    let mut offset = 0u64;
    let mut part_number = 1u32;

    while offset < file_size {
        let end = std::cmp::min(offset + chunk_size, file_size);
        spans.push(ChunkSpan {
            part_number,
            start_offset: offset,
            length: end - offset,
        });
        offset = end;
        part_number += 1;
    }

    if spans.is_empty() {
        spans.push(ChunkSpan {
            part_number: 1,
            start_offset: 0,
            length: 0,
        });
    }

    debug!(
        "分片规划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        file_size,
        chunk_size,
        spans.len()
    );

    ChunkPlan { chunk_size, spans }
}

/// 分片描述（含校验和），计算后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub part_number: u32,
    pub start_offset: u64,
    pub length: u64,
    /// SHA-256（base64）
    pub checksum: String,
}

impl ChunkDescriptor {
    pub fn range(&self) -> Range<u64> {
        self.start_offset..self.start_offset + self.length
    }
}

/// 按顺序计算每个分片的校验和
///
/// 顺序读取，输出顺序与分片编号一致
pub async fn describe_chunks(file: &UploadFile, plan: &ChunkPlan) -> Result<Vec<ChunkDescriptor>> {
    let mut descriptors = Vec::with_capacity(plan.chunk_count());

    for span in &plan.spans {
        let checksum = checksum_range(file, span.range()).await?;
        descriptors.push(ChunkDescriptor {
            part_number: span.part_number,
            start_offset: span.start_offset,
            length: span.length,
            checksum,
        });
    }

    info!(
        "分片校验和计算完成: file={}, {} 个分片, chunk_size={} bytes",
        file.name,
        descriptors.len(),
        plan.chunk_size
    );

    Ok(descriptors)
}

/// 分片上传记录（按完成顺序累积）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUploadRecord {
    pub part_number: u32,
    /// 存储服务返回的 ETag（已去除引号）
    pub etag: String,
    pub checksum: String,
    /// 成功前经历的在线重试次数
    pub retry_count: u32,
}

/// 分片重试状态（随调度循环传递）
#[derive(Debug)]
pub struct ChunkRetryState {
    /// 分片在描述列表中的下标
    pub index: usize,
    pub part_number: u32,
    /// 已消耗的重试次数
    pub retries: u32,
    /// 上一次失败原因
    pub last_error: Option<UploadError>,
}

impl ChunkRetryState {
    pub fn new(index: usize, part_number: u32) -> Self {
        Self {
            index,
            part_number,
            retries: 0,
            last_error: None,
        }
    }

    /// 在线失败：消耗一次重试
    pub fn record_retry(&mut self, error: UploadError) {
        self.retries += 1;
        self.last_error = Some(error);
    }

    /// 离线失败：不消耗重试次数，等待网络恢复
    pub fn defer_offline(&mut self) {
        self.last_error = Some(UploadError::OfflineDeferred);
    }

    /// 上一次失败原因（用于日志）
    pub fn last_error_message(&self) -> String {
        self.last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "无".to_string())
    }
}

/// 生成合并请求的分片列表
///
/// 存储服务要求分片编号严格递增且连续，这里按编号排序并校验
/// 编号集合恰好为 1..=chunk_count
pub fn completed_parts(
    records: &[PartUploadRecord],
    chunk_count: usize,
) -> Result<Vec<CompletedPart>> {
    let mut sorted: Vec<&PartUploadRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.part_number);

    let contiguous = sorted.len() == chunk_count
        && sorted
            .iter()
            .enumerate()
            .all(|(i, r)| r.part_number as usize == i + 1);

    if !contiguous {
        return Err(UploadError::Transport(format!(
            "分片记录不完整: 期望 {} 个连续分片，实际 {:?}",
            chunk_count,
            sorted.iter().map(|r| r.part_number).collect::<Vec<_>>()
        )));
    }

    Ok(sorted
        .into_iter()
        .map(|r| CompletedPart {
            part_number: r.part_number,
            etag: r.etag.clone(),
            checksum_sha256: r.checksum.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::checksum::sha256_base64;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    fn record(part_number: u32) -> PartUploadRecord {
        PartUploadRecord {
            part_number,
            etag: format!("etag-{}", part_number),
            checksum: String::new(),
            retry_count: 0,
        }
    }

    #[test]
    fn test_twelve_mib_default_chunks() {
        let plan = plan_chunks(12 * MIB, DEFAULT_CHUNK_SIZE, MAX_CHUNKS);
        assert_eq!(plan.chunk_count(), 3);
        let lengths: Vec<u64> = plan.spans.iter().map(|s| s.length).collect();
        assert_eq!(lengths, vec![5 * MIB, 5 * MIB, 2 * MIB]);
        assert_eq!(plan.spans[2].start_offset, 10 * MIB);
    }

    #[test]
    fn test_exact_multiple() {
        let plan = plan_chunks(10 * MIB, DEFAULT_CHUNK_SIZE, MAX_CHUNKS);
        assert_eq!(plan.chunk_count(), 2);
        assert_eq!(plan.spans[1].range(), (5 * MIB)..(10 * MIB));
    }

    #[test]
    fn test_chunk_size_recomputed_when_too_many() {
        // 6000MB / 5MB = 1200 个分片，超过上限
        let size = 6000 * MIB;
        let plan = plan_chunks(size, DEFAULT_CHUNK_SIZE, MAX_CHUNKS);
        assert_eq!(plan.chunk_size, size.div_ceil(MAX_CHUNKS));
        assert_eq!(plan.chunk_count(), 1000);
    }

    #[test]
    fn test_empty_file_single_empty_chunk() {
        let plan = plan_chunks(0, DEFAULT_CHUNK_SIZE, MAX_CHUNKS);
        assert_eq!(plan.chunk_count(), 1);
        assert_eq!(plan.spans[0].length, 0);
        assert_eq!(plan.spans[0].part_number, 1);
    }

    #[tokio::test]
    async fn test_describe_chunks_in_order() {
        let file = UploadFile::from_bytes("a.txt", b"aaaabbbbcc".to_vec());
        let plan = plan_chunks(file.size, 4, MAX_CHUNKS);
        let descriptors = describe_chunks(&file, &plan).await.unwrap();

        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].checksum, sha256_base64(b"aaaa"));
        assert_eq!(descriptors[1].checksum, sha256_base64(b"bbbb"));
        assert_eq!(descriptors[2].checksum, sha256_base64(b"cc"));
        assert_eq!(descriptors[2].range(), 8..10);
    }

    #[test]
    fn test_completed_parts_sorted() {
        let records = vec![record(3), record(1), record(2)];
        let parts = completed_parts(&records, 3).unwrap();
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(parts[0].etag, "etag-1");
    }

    #[test]
    fn test_completed_parts_rejects_gaps_and_duplicates() {
        assert!(completed_parts(&[record(1), record(3)], 2).is_err());
        assert!(completed_parts(&[record(1), record(1)], 2).is_err());
        assert!(completed_parts(&[record(1)], 2).is_err());
    }

    #[test]
    fn test_retry_state_offline_keeps_budget() {
        let mut state = ChunkRetryState::new(0, 1);
        assert_eq!(state.last_error_message(), "无");

        state.defer_offline();
        assert_eq!(state.retries, 0);
        assert!(matches!(state.last_error, Some(UploadError::OfflineDeferred)));

        state.record_retry(UploadError::Timeout);
        assert_eq!(state.retries, 1);
        assert!(matches!(state.last_error, Some(UploadError::Timeout)));
        assert_eq!(state.last_error_message(), UploadError::Timeout.to_string());
    }

    #[test]
    fn test_retry_backoff_delay() {
        assert_eq!(retry_backoff_delay(0, 100), 0);
        assert_eq!(retry_backoff_delay(1, 100), 100);
        assert_eq!(retry_backoff_delay(2, 100), 200);
        assert_eq!(retry_backoff_delay(3, 100), 400);
        assert_eq!(retry_backoff_delay(20, 100), 5000); // 超过最大值
        assert_eq!(retry_backoff_delay(3, 0), 0);
    }

    proptest! {
        #[test]
        fn prop_chunks_cover_file(size in 0u64..(64 * 1024 * 1024 * 1024), chunk_size in 1u64..(64 * 1024 * 1024)) {
            let plan = plan_chunks(size, chunk_size, MAX_CHUNKS);

            prop_assert!(plan.chunk_count() as u64 <= MAX_CHUNKS);
            if size.div_ceil(chunk_size) <= MAX_CHUNKS && size > 0 {
                prop_assert_eq!(plan.chunk_count() as u64, size.div_ceil(chunk_size));
            }

            // 连续编号、无空洞、无重叠、总长度等于文件大小
            let mut expected_offset = 0u64;
            for (i, span) in plan.spans.iter().enumerate() {
                prop_assert_eq!(span.part_number as usize, i + 1);
                prop_assert_eq!(span.start_offset, expected_offset);
                expected_offset += span.length;
            }
            prop_assert_eq!(expected_offset, size);
        }
    }
}
