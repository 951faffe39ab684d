// 网络连通性状态
//
// 由宿主环境（或测试）设置在线/离线，分片调度循环订阅状态变化：
// 离线时暂停派发新分片，恢复在线后继续

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// 连通性状态源
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// 更新在线状态（状态未变化时不通知订阅者）
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            info!("网络状态变化: {}", if online { "在线" } else { "离线" });
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_online() {
        let connectivity = Connectivity::default();
        assert!(connectivity.is_online());

        connectivity.set_online(false);
        assert!(!connectivity.is_online());

        let cloned = connectivity.clone();
        cloned.set_online(true);
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn test_subscribe_notified_only_on_change() {
        let connectivity = Connectivity::new(true);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(true);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(false);
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!*rx.borrow_and_update());
    }
}
