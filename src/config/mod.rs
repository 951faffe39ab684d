// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 存储服务端点配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天，按天滚动）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 任务准入策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// 串行准入：只有当前没有上传中的任务时才启动下一个
    Serial,
    /// 并行准入：上传中的任务数低于 max_uploads 时持续启动
    Parallel,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy::Serial
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_max_uploads")]
    pub max_uploads: usize,
    /// 任务准入策略
    #[serde(default)]
    pub admission: AdmissionPolicy,
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 单文件最大分片数
    #[serde(default = "default_max_chunks")]
    pub max_chunks: u64,
    /// 单文件同时上传的分片数
    #[serde(default = "default_concurrent_chunks")]
    pub concurrent_chunks: usize,
    /// 分片最大重试次数（仅在线失败计数）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试前的初始退避时间（毫秒），0 表示立即重试
    #[serde(default)]
    pub retry_backoff_ms: u64,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 超过该大小（MB）的文件使用分片上传
    #[serde(default = "default_multipart_threshold_mb")]
    pub multipart_threshold_mb: u64,
}

fn default_max_uploads() -> usize {
    100
}
fn default_chunk_size_mb() -> u64 {
    5
}
fn default_max_chunks() -> u64 {
    1000
}
fn default_concurrent_chunks() -> usize {
    3
}
fn default_max_retries() -> u32 {
    1
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_multipart_threshold_mb() -> u64 {
    5
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_uploads: default_max_uploads(),
            admission: AdmissionPolicy::default(),
            chunk_size_mb: default_chunk_size_mb(),
            max_chunks: default_max_chunks(),
            concurrent_chunks: default_concurrent_chunks(),
            max_retries: default_max_retries(),
            retry_backoff_ms: 0,
            request_timeout_secs: default_request_timeout_secs(),
            multipart_threshold_mb: default_multipart_threshold_mb(),
        }
    }
}

impl UploadConfig {
    /// 分片大小（字节）
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    /// 分片上传阈值（字节）
    pub fn multipart_threshold_bytes(&self) -> u64 {
        self.multipart_threshold_mb * 1024 * 1024
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.max_uploads == 0 {
            anyhow::bail!("max_uploads 必须大于 0");
        }
        if self.chunk_size_mb == 0 {
            anyhow::bail!("chunk_size_mb 必须大于 0");
        }
        if self.max_chunks == 0 {
            anyhow::bail!("max_chunks 必须大于 0");
        }
        if self.concurrent_chunks == 0 {
            anyhow::bail!("concurrent_chunks 必须大于 0");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs 必须大于 0");
        }
        Ok(())
    }
}

/// 存储服务端点配置
///
/// 分片会话的创建/合并以及小文件直传都由外部服务提供
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 服务基础地址
    pub api_base_url: String,
    /// 创建分片上传会话的路径
    #[serde(default = "default_initiate_path")]
    pub initiate_path: String,
    /// 合并分片的路径
    #[serde(default = "default_complete_path")]
    pub complete_path: String,
    /// 小文件直传路径
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
}

fn default_initiate_path() -> String {
    "/api/multipart-upload".to_string()
}
fn default_complete_path() -> String {
    "/api/multipart-upload/complete".to_string()
}
fn default_upload_path() -> String {
    "/api/upload".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000".to_string(),
            initiate_path: default_initiate_path(),
            complete_path: default_complete_path(),
            upload_path: default_upload_path(),
        }
    }
}

impl StorageConfig {
    fn join(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }

    /// 创建会话的完整地址
    pub fn initiate_url(&self) -> String {
        self.join(&self.initiate_path)
    }

    /// 合并分片的完整地址
    pub fn complete_url(&self) -> String {
        self.join(&self.complete_path)
    }

    /// 直传的完整地址
    pub fn upload_url(&self) -> String {
        self.join(&self.upload_path)
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config.upload.validate().context("上传配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.upload.validate().context("保存配置失败：上传配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_upload_config() {
        let config = UploadConfig::default();
        assert_eq!(config.max_uploads, 100);
        assert_eq!(config.admission, AdmissionPolicy::Serial);
        assert_eq!(config.chunk_size_bytes(), 5 * 1024 * 1024);
        assert_eq!(config.max_chunks, 1000);
        assert_eq!(config.concurrent_chunks, 3);
        assert_eq!(config.max_retries, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = UploadConfig {
            concurrent_chunks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let content = r#"
            [upload]
            admission = "parallel"
            max_uploads = 4

            [storage]
            api_base_url = "https://files.example.com/"
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.upload.admission, AdmissionPolicy::Parallel);
        assert_eq!(config.upload.max_uploads, 4);
        assert_eq!(config.upload.concurrent_chunks, 3);
        assert_eq!(
            config.storage.initiate_url(),
            "https://files.example.com/api/multipart-upload"
        );
        assert_eq!(
            config.storage.complete_url(),
            "https://files.example.com/api/multipart-upload/complete"
        );
        assert!(config.log.enabled);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config/app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.max_retries = 4;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.max_retries, 4);
        assert_eq!(loaded.storage.upload_url(), "http://127.0.0.1:3000/api/upload");
    }

    #[tokio::test]
    async fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default("/nonexistent/app.toml").await;
        assert_eq!(config.upload.max_uploads, 100);
    }
}
