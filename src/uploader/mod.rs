// 上传引擎模块
//
// - 管理器：任务队列、准入策略、状态集合、事件转发
// - 分片上传：分片规划、校验和、受限并发、重试与离线恢复
// - 表单直传：小文件单次上传

pub mod checksum;
pub mod chunk;
pub mod connectivity;
pub mod manager;
pub mod multipart;
pub mod single;
pub mod strategy;
pub mod task;

pub use chunk::{
    plan_chunks, ChunkDescriptor, ChunkPlan, PartUploadRecord, DEFAULT_CHUNK_SIZE, MAX_CHUNKS,
};
pub use connectivity::Connectivity;
pub use manager::{ManagerSettings, StatusSnapshot, UploadManager};
pub use multipart::{MultipartSettings, MultipartUpload};
pub use single::SingleUpload;
pub use strategy::{StrategyEvent, StrategyOutcome, UploadStrategy};
pub use task::{
    JobStatus, UploadFile, UploadJob, UploadMethod, UploadRequest, PROGRESS_PREPARING,
    PROGRESS_UNSTARTED,
};
