// 上传任务定义
//
// 一个 UploadJob 对应一次文件上传请求，由 UploadManager 统一跟踪状态

use crate::error::{Result, UploadError};
use crate::storage::StorageReply;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 进度：尚未开始
pub const PROGRESS_UNSTARTED: i32 = -1;

/// 进度：准备中（分片哈希计算中）
pub const PROGRESS_PREPARING: i32 = -2;

/// 文件数据来源
#[derive(Clone)]
enum FileSource {
    /// 本地文件
    Path(PathBuf),
    /// 内存数据
    Memory(Arc<[u8]>),
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            FileSource::Memory(data) => write!(f, "Memory({} bytes)", data.len()),
        }
    }
}

/// 待上传文件
#[derive(Debug, Clone, Serialize)]
pub struct UploadFile {
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
    #[serde(skip)]
    source: FileSource,
}

impl UploadFile {
    /// 打开本地文件
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;

        if metadata.is_dir() {
            return Err(UploadError::BadRequest(format!(
                "不支持直接上传目录: {:?}",
                path
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self {
            name,
            size: metadata.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// 从内存数据创建
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data: Arc<[u8]> = Arc::from(data.into());
        Self {
            name: name.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }

    /// 读取指定字节范围
    pub async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        if range.end > self.size || range.start > range.end {
            return Err(UploadError::BadRequest(format!(
                "读取范围越界: {}..{}, 文件大小={}",
                range.start, range.end, self.size
            )));
        }

        match &self.source {
            FileSource::Memory(data) => Ok(data[range.start as usize..range.end as usize].to_vec()),
            FileSource::Path(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || {
                    use std::io::{Read, Seek, SeekFrom};

                    let mut file = std::fs::File::open(&path)?;
                    file.seek(SeekFrom::Start(range.start))?;

                    let mut buffer = vec![0u8; (range.end - range.start) as usize];
                    file.read_exact(&mut buffer)?;
                    Ok::<_, UploadError>(buffer)
                })
                .await
                .map_err(|e| UploadError::Transport(format!("读取任务异常: {}", e)))?
            }
        }
    }

    /// 读取完整文件
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        self.read_range(0..self.size).await
    }
}

/// 直传请求方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadMethod {
    #[default]
    Post,
    Put,
}

/// 上传请求（调用方提交的参数）
#[derive(Debug, Clone, Serialize)]
pub struct UploadRequest {
    /// 任务ID（调用方保证唯一）
    pub id: String,
    /// 来源分组标签
    pub origin: String,
    /// 直传目标地址
    pub url: String,
    /// 直传请求方法
    pub method: UploadMethod,
    /// 请求头（作用于该任务的所有请求）
    pub headers: BTreeMap<String, String>,
    /// 额外表单字段
    pub form_fields: BTreeMap<String, String>,
    /// 文件字段名
    pub file_field: String,
    /// 是否使用分片上传
    pub multipart: bool,
    /// 文件
    pub file: UploadFile,
}

impl UploadRequest {
    pub fn new(
        id: impl Into<String>,
        origin: impl Into<String>,
        url: impl Into<String>,
        file: UploadFile,
    ) -> Self {
        Self {
            id: id.into(),
            origin: origin.into(),
            url: url.into(),
            method: UploadMethod::Post,
            headers: BTreeMap::new(),
            form_fields: BTreeMap::new(),
            file_field: "file".to_string(),
            multipart: false,
            file,
        }
    }

    pub fn with_method(mut self, method: UploadMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_form_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form_fields.insert(name.into(), value.into());
        self
    }

    pub fn with_file_field(mut self, name: impl Into<String>) -> Self {
        self.file_field = name.into();
        self
    }

    pub fn multipart(mut self, multipart: bool) -> Self {
        self.multipart = multipart;
        self
    }

    /// 校验必填参数
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(UploadError::BadRequest("缺少任务ID".to_string()));
        }
        if self.origin.trim().is_empty() {
            return Err(UploadError::BadRequest("缺少 origin".to_string()));
        }
        if self.url.trim().is_empty() {
            return Err(UploadError::BadRequest("缺少上传地址".to_string()));
        }
        Ok(())
    }
}

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    /// 等待中
    Pending,
    /// 上传中
    InProgress,
    /// 已完成
    Complete,
    /// 失败
    Error,
    /// 已取消
    Aborted,
}

impl JobStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Error | JobStatus::Aborted
        )
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize)]
pub struct UploadJob {
    /// 任务ID
    pub id: String,
    /// 来源分组标签
    pub origin: String,
    /// 任务状态
    pub status: JobStatus,
    /// 进度 0-100，-1 表示未开始，-2 表示准备中
    pub progress: i32,
    /// 提交参数
    pub request: UploadRequest,
    /// 最终响应状态码
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    /// 最终响应原文
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
    /// 最终响应（可解析为 JSON 时）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 结束时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadJob {
    /// 创建等待中的任务
    pub fn new(request: UploadRequest) -> Self {
        Self {
            id: request.id.clone(),
            origin: request.origin.clone(),
            status: JobStatus::Pending,
            progress: PROGRESS_UNSTARTED,
            request,
            response_status: None,
            response_text: None,
            response: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 文件名
    pub fn file_name(&self) -> &str {
        &self.request.file.name
    }

    /// 标记为上传中
    pub fn mark_in_progress(&mut self) {
        self.status = JobStatus::InProgress;
        self.progress = PROGRESS_UNSTARTED;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为准备中
    pub fn mark_preparing(&mut self) {
        self.progress = PROGRESS_PREPARING;
    }

    /// 记录响应
    fn record_reply(&mut self, reply: &StorageReply) {
        self.response_status = Some(reply.status);
        self.response_text = Some(reply.body.clone());
        self.response = serde_json::from_str(&reply.body).ok();
    }

    /// 标记为已完成
    pub fn mark_complete(&mut self, reply: &StorageReply) {
        self.status = JobStatus::Complete;
        self.progress = 100;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.record_reply(reply);
    }

    /// 标记为失败
    pub fn mark_error(&mut self, error: String, reply: Option<&StorageReply>) {
        self.status = JobStatus::Error;
        self.error = Some(error);
        self.completed_at = Some(chrono::Utc::now().timestamp());
        if let Some(reply) = reply {
            self.record_reply(reply);
        }
    }

    /// 标记为已取消
    pub fn mark_aborted(&mut self) {
        self.status = JobStatus::Aborted;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_request() -> UploadRequest {
        UploadRequest::new(
            "photo.png-1",
            "connect",
            "https://files.example.com/api/upload",
            UploadFile::from_bytes("photo.png", b"0123456789".to_vec()),
        )
    }

    #[test]
    fn test_validate_request() {
        assert!(sample_request().validate().is_ok());

        let mut request = sample_request();
        request.id = String::new();
        assert!(matches!(
            request.validate(),
            Err(UploadError::BadRequest(_))
        ));

        let mut request = sample_request();
        request.origin = "  ".to_string();
        assert!(request.validate().is_err());

        let mut request = sample_request();
        request.url = String::new();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_job_creation() {
        let job = UploadJob::new(sample_request());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, PROGRESS_UNSTARTED);
        assert_eq!(job.file_name(), "photo.png");
        assert_eq!(job.request.file_field, "file");
        assert_eq!(job.request.method, UploadMethod::Post);
    }

    #[test]
    fn test_status_transitions() {
        let mut job = UploadJob::new(sample_request());

        job.mark_in_progress();
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.started_at.is_some());

        job.mark_preparing();
        assert_eq!(job.progress, PROGRESS_PREPARING);

        let reply = StorageReply {
            status: 200,
            body: r#"{"message":"Upload complete","location":"s3://bucket/key"}"#.to_string(),
        };
        job.mark_complete(&reply);
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.progress, 100);
        assert_eq!(job.response_status, Some(200));
        assert_eq!(
            job.response.as_ref().unwrap()["location"],
            serde_json::json!("s3://bucket/key")
        );
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_error_keeps_non_json_body() {
        let mut job = UploadJob::new(sample_request());
        job.mark_in_progress();

        let reply = StorageReply {
            status: 502,
            body: "bad gateway".to_string(),
        };
        job.mark_error("status 502".to_string(), Some(&reply));
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.response_text.as_deref(), Some("bad gateway"));
        assert!(job.response.is_none());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"INPROGRESS\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::Aborted).unwrap(),
            "\"ABORTED\""
        );
    }

    #[tokio::test]
    async fn test_read_range_from_disk() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"abcdefghij").unwrap();
        temp_file.flush().unwrap();

        let file = UploadFile::open(temp_file.path()).await.unwrap();
        assert_eq!(file.size, 10);
        assert_eq!(file.read_range(2..5).await.unwrap(), b"cde".to_vec());
        assert_eq!(file.read_all().await.unwrap(), b"abcdefghij".to_vec());
    }

    #[tokio::test]
    async fn test_read_range_out_of_bounds() {
        let file = UploadFile::from_bytes("a.bin", vec![1u8; 4]);
        assert!(file.read_range(2..8).await.is_err());
    }

    #[tokio::test]
    async fn test_open_directory_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = UploadFile::open(dir.path()).await;
        assert!(matches!(result, Err(UploadError::BadRequest(_))));
    }
}
