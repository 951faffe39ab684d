// 上传错误定义
//
// 错误分类：
// - BadRequest: 提交参数不完整，同步返回给调用方，不会入队
// - Transport / HttpStatus / Timeout: 分片级可重试错误
// - ChunkExhausted: 在线状态下分片重试次数耗尽，任务级致命错误
// - Aborted: 用户取消
// - OfflineDeferred: 离线期间失败的分片，等待网络恢复后重新排队（非终态）

/// 上传错误
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("传输错误: {0}")]
    Transport(String),

    #[error("服务器返回异常状态: status={status}, body={body}")]
    HttpStatus { status: u16, body: String },

    #[error("请求超时")]
    Timeout,

    #[error("分片 #{part_number} 上传失败，已达最大重试次数 ({retries})")]
    ChunkExhausted { part_number: u32, retries: u32 },

    #[error("上传已取消")]
    Aborted,

    #[error("网络离线，分片等待重新上传")]
    OfflineDeferred,

    #[error("文件读取失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 解析失败: {0}")]
    Json(#[from] serde_json::Error),
}

/// 错误类别（用于事件负载和日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    BadRequest,
    TransportError,
    Timeout,
    ChunkExhausted,
    Aborted,
    OfflineDeferred,
}

impl UploadError {
    /// 获取错误类别
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::BadRequest(_) => UploadErrorKind::BadRequest,
            UploadError::Timeout => UploadErrorKind::Timeout,
            UploadError::ChunkExhausted { .. } => UploadErrorKind::ChunkExhausted,
            UploadError::Aborted => UploadErrorKind::Aborted,
            UploadError::OfflineDeferred => UploadErrorKind::OfflineDeferred,
            UploadError::Transport(_)
            | UploadError::HttpStatus { .. }
            | UploadError::Io(_)
            | UploadError::Json(_) => UploadErrorKind::TransportError,
        }
    }

    /// 是否可在分片级重试
    ///
    /// 传输错误、超时、非 2xx 状态都按同一重试策略处理
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadError::Transport(_)
                | UploadError::HttpStatus { .. }
                | UploadError::Timeout
                | UploadError::OfflineDeferred
        )
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UploadError::Timeout
        } else {
            UploadError::Transport(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(
            UploadError::BadRequest("id".to_string()).kind(),
            UploadErrorKind::BadRequest
        );
        assert_eq!(
            UploadError::HttpStatus {
                status: 500,
                body: String::new()
            }
            .kind(),
            UploadErrorKind::TransportError
        );
        assert_eq!(UploadError::Timeout.kind(), UploadErrorKind::Timeout);
        assert_eq!(
            UploadError::ChunkExhausted {
                part_number: 2,
                retries: 1
            }
            .kind(),
            UploadErrorKind::ChunkExhausted
        );
    }

    #[test]
    fn test_retriable() {
        assert!(UploadError::Transport("reset".to_string()).is_retriable());
        assert!(UploadError::Timeout.is_retriable());
        assert!(UploadError::HttpStatus {
            status: 503,
            body: String::new()
        }
        .is_retriable());

        assert!(!UploadError::Aborted.is_retriable());
        assert!(!UploadError::BadRequest("url".to_string()).is_retriable());
        assert!(!UploadError::ChunkExhausted {
            part_number: 1,
            retries: 1
        }
        .is_retriable());
    }

    #[test]
    fn test_display() {
        let err = UploadError::ChunkExhausted {
            part_number: 3,
            retries: 1,
        };
        assert_eq!(err.to_string(), "分片 #3 上传失败，已达最大重试次数 (1)");
    }
}
