//! 进程内消息总线：broadcast 主题分发 + 有界最近消息环 + 按 id 的弱引用查找

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::memory::WeakCache;

pub const TOPIC_AGENT_REGISTERED: &str = "agent.registered";
pub const TOPIC_TASK_STARTED: &str = "task.started";
pub const TOPIC_TASK_FINISHED: &str = "task.finished";

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct BusMessage {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

pub struct MessageBus {
    sender: broadcast::Sender<Arc<BusMessage>>,
    recent: Mutex<VecDeque<Arc<BusMessage>>>,
    capacity: usize,
    /// 环中淘汰后，只要仍有订阅者持有即可查到
    by_id: WeakCache<BusMessage>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            by_id: WeakCache::new(),
        }
    }

    /// 发布消息；没有订阅者时只进入最近消息环
    pub fn publish(&self, topic: &str, payload: Value) -> Arc<BusMessage> {
        let message = Arc::new(BusMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            timestamp: Utc::now(),
        });
        self.by_id.insert(message.id.clone(), &message);
        {
            let mut recent = self.recent.lock();
            recent.push_back(Arc::clone(&message));
            while recent.len() > self.capacity {
                recent.pop_front();
            }
        }
        let receivers = self.sender.send(Arc::clone(&message)).unwrap_or(0);
        tracing::trace!(topic, receivers, "bus message published");
        message
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BusMessage>> {
        self.sender.subscribe()
    }

    /// 最近消息，可按主题过滤
    pub fn recent(&self, topic: Option<&str>) -> Vec<Arc<BusMessage>> {
        self.recent
            .lock()
            .iter()
            .filter(|m| topic.map(|t| m.topic == t).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<BusMessage>> {
        self.by_id.get(id)
    }

    /// 清除已失效的弱引用，返回清除数
    pub fn purge(&self) -> usize {
        self.by_id.purge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_published_messages() {
        let bus = MessageBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(TOPIC_TASK_STARTED, json!({"task_id": "t1"}));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, TOPIC_TASK_STARTED);
        assert_eq!(msg.payload["task_id"], "t1");
    }

    #[test]
    fn test_ring_is_bounded_and_weak_lookup() {
        let bus = MessageBus::new(2);
        let first = bus.publish("a", json!(1));
        let first_id = first.id.clone();
        bus.publish("b", json!(2));
        bus.publish("a", json!(3));
        assert_eq!(bus.recent(None).len(), 2);
        assert_eq!(bus.recent(Some("a")).len(), 1);

        // 仍被持有，可查
        assert!(bus.lookup(&first_id).is_some());
        drop(first);
        assert!(bus.lookup(&first_id).is_none());
        assert_eq!(bus.purge(), 1);
    }
}
