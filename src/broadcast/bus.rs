use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// 共享频道上的一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
    /// 发送方 tab id
    pub origin: String,
}

/// profile 范围内的发布/订阅传输。
/// 进程内用 [`LocalBus`]，跨进程用 [`SqliteBus`](super::SqliteBus)。
pub trait BroadcastTransport: Send + Sync {
    fn name(&self) -> &str;

    /// 发出即忘。没有任何接收方时返回 false
    fn post(&self, envelope: Envelope) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// 进程内命名总线。克隆共享同一频道，积压的接收方丢失最旧的信封
#[derive(Clone)]
pub struct LocalBus {
    name: Arc<str>,
    sender: broadcast::Sender<Envelope>,
}

impl LocalBus {
    pub fn new(name: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: Arc::from(name),
            sender,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl BroadcastTransport for LocalBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, envelope: Envelope) -> bool {
        self.sender.send(envelope).is_ok()
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}
