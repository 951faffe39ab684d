//! 上传事件类型定义

use crate::uploader::{StatusSnapshot, UploadJob};
use serde::Serialize;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// 任务已入队
    Pending,
    /// 开始计算分片校验和
    Prepare,
    /// 进度更新
    Progress,
    /// 任务失败
    Error,
    /// 任务已取消
    Aborted,
    /// 任务完成
    Done,
    /// 网络恢复
    Online,
    /// 网络断开
    Offline,
    /// 任务开始上传
    Start,
}

impl EventKind {
    /// 是否为终态事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Error | EventKind::Aborted | EventKind::Done)
    }
}

/// 单任务事件
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: EventKind,
    pub job_id: String,
    /// 当前进度（-2 准备中，-1 未开始，0-100）
    pub progress: i32,
    /// 事件发生时的任务快照
    pub job: UploadJob,
}

/// 全局事件
#[derive(Debug, Clone, Serialize)]
pub struct GlobalEvent {
    pub kind: EventKind,
    /// 事件发生时所有集合的快照
    pub snapshot: StatusSnapshot,
    /// 触发事件的任务
    pub job: UploadJob,
}
