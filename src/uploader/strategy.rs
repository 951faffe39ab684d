// 上传策略接口
//
// 管理器为每个任务绑定一个策略（分片上传或表单直传），策略通过事件通道
// 回报准备、进度和网络状态，最终以 StrategyOutcome 结束

use crate::error::UploadError;
use crate::storage::StorageReply;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 策略运行期间上报的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyEvent {
    /// 开始准备（计算分片校验和）
    Prepare,
    /// 进度更新
    Progress { loaded: u64, total: u64 },
    /// 网络恢复
    Online,
    /// 网络断开
    Offline,
}

/// 策略结束结果
#[derive(Debug)]
pub enum StrategyOutcome {
    /// 服务端已返回最终响应（状态码由管理器判定）
    Finished(StorageReply),
    /// 上传失败
    Failed(UploadError),
    /// 已取消
    Aborted,
}

/// 策略事件发送端
pub type EventSink = mpsc::UnboundedSender<StrategyEvent>;

/// 上传策略
#[async_trait]
pub trait UploadStrategy: Send + Sync {
    /// 执行上传，直到完成、失败或被取消
    async fn upload(&self, events: EventSink) -> StrategyOutcome;

    /// 取消上传（幂等）
    ///
    /// 取消后进行中的请求立即中止，upload 返回 Aborted
    fn cancel(&self);
}

/// 忽略已关闭的接收端
pub(crate) fn emit(events: &EventSink, event: StrategyEvent) {
    let _ = events.send(event);
}
