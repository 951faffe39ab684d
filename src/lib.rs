// Relay Upload Library
// 对象存储上传客户端核心库

// 配置管理模块
pub mod config;

// 错误定义
pub mod error;

// 事件模块
pub mod events;

// 日志模块
pub mod logging;

// 存储服务模块
pub mod storage;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::{AdmissionPolicy, AppConfig};
pub use error::{UploadError, UploadErrorKind};
pub use events::{EventKind, GlobalEvent, JobEvent, NotificationBus, Subscription};
pub use storage::{HttpStorageClient, StorageClient};
pub use uploader::{
    Connectivity, JobStatus, ManagerSettings, StatusSnapshot, UploadFile, UploadJob,
    UploadManager, UploadRequest,
};
