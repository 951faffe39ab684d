//! 事件总线
//!
//! 每个订阅者持有一个无界通道，发布时依次投递：
//! - 投递按发布顺序同步完成，不等待订阅者消费
//! - 订阅者已断开时直接移除，不影响其他订阅者
//! - 任务进入终态后关闭该任务的全部订阅

use crate::events::{GlobalEvent, JobEvent};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

type Subscribers<T> = Vec<(u64, mpsc::UnboundedSender<T>)>;

/// 事件总线
#[derive(Default)]
pub struct NotificationBus {
    /// job_id -> 订阅者
    job_subscribers: DashMap<String, Subscribers<JobEvent>>,
    /// 全局订阅者
    global_subscribers: Mutex<Subscribers<GlobalEvent>>,
    /// 订阅 ID 计数器
    next_id: AtomicU64,
}

/// 订阅范围
#[derive(Debug, Clone)]
enum Scope {
    Job(String),
    Global,
}

/// 订阅句柄，Drop 时自动取消订阅
pub struct Subscription<T> {
    id: u64,
    scope: Scope,
    rx: mpsc::UnboundedReceiver<T>,
    bus: Weak<NotificationBus>,
}

impl<T> Subscription<T> {
    /// 接收下一个事件，订阅关闭后返回 None
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// 非阻塞接收
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.scope, self.id);
        }
    }
}

impl NotificationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 订阅单个任务的事件
    pub fn subscribe_job(self: &Arc<Self>, job_id: &str) -> Subscription<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();

        self.job_subscribers
            .entry(job_id.to_string())
            .or_default()
            .push((id, tx));

        Subscription {
            id,
            scope: Scope::Job(job_id.to_string()),
            rx,
            bus: Arc::downgrade(self),
        }
    }

    /// 订阅全局事件
    pub fn subscribe_all(self: &Arc<Self>) -> Subscription<GlobalEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();

        self.global_subscribers.lock().push((id, tx));

        Subscription {
            id,
            scope: Scope::Global,
            rx,
            bus: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, scope: &Scope, id: u64) {
        match scope {
            Scope::Job(job_id) => {
                let empty = match self.job_subscribers.get_mut(job_id) {
                    Some(mut subscribers) => {
                        subscribers.retain(|(sid, _)| *sid != id);
                        subscribers.is_empty()
                    }
                    None => false,
                };
                if empty {
                    self.job_subscribers
                        .remove_if(job_id, |_, subscribers| subscribers.is_empty());
                }
            }
            Scope::Global => {
                self.global_subscribers.lock().retain(|(sid, _)| *sid != id);
            }
        }
    }

    /// 发布任务事件
    pub fn publish_job(&self, event: JobEvent) {
        if let Some(mut subscribers) = self.job_subscribers.get_mut(&event.job_id) {
            subscribers.retain(|(id, tx)| {
                let delivered = tx.send(event.clone()).is_ok();
                if !delivered {
                    debug!("任务订阅者已断开，移除: job={}, subscriber={}", event.job_id, id);
                }
                delivered
            });
        }
    }

    /// 发布全局事件
    pub fn publish_global(&self, event: GlobalEvent) {
        self.global_subscribers
            .lock()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// 关闭任务的全部订阅（订阅者会在读完剩余事件后收到 None）
    pub fn close_job(&self, job_id: &str) {
        if let Some((_, subscribers)) = self.job_subscribers.remove(job_id) {
            debug!("关闭任务订阅: job={}, subscribers={}", job_id, subscribers.len());
        }
    }

    /// 任务订阅者数量
    pub fn job_subscriber_count(&self, job_id: &str) -> usize {
        self.job_subscribers
            .get(job_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// 全局订阅者数量
    pub fn global_subscriber_count(&self) -> usize {
        self.global_subscribers.lock().len()
    }
}
