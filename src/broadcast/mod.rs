//! 跨 Tab 广播
//!
//! 一个传输通道承载所有 topic，每个 topic 至多一个 handler（后注册的覆盖先注册的）。
//! 投递至多一次、尽力而为：对端订阅前发送的、对端积压丢弃的以及没有传输通道时发送的
//! 信封都会静默丢失。Tab 永远收不到自己发出的信封。

pub mod bus;
pub mod sqlite;

pub use bus::{BroadcastTransport, Envelope, LocalBus};
pub use sqlite::SqliteBus;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const TOPIC_MESSAGE: &str = "message";
pub const TOPIC_MESSAGE_DELETED: &str = "message-deleted";
pub const TOPIC_MESSAGE_UPDATED: &str = "message-updated";
pub const TOPIC_CONNECTION_STATE: &str = "connection-state";

type Handler = Arc<dyn Fn(Value) + Send + Sync>;
type Handlers = Arc<Mutex<HashMap<String, Handler>>>;

pub struct BroadcastService {
    origin: String,
    transport: Option<Arc<dyn BroadcastTransport>>,
    handlers: Handlers,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BroadcastService {
    /// 以 `origin` 身份接入 `transport`。提供传输通道时必须在 tokio runtime 内调用。
    pub fn new(origin: impl Into<String>, transport: Option<Arc<dyn BroadcastTransport>>) -> Self {
        let origin = origin.into();
        let handlers: Handlers = Arc::new(Mutex::new(HashMap::new()));

        let dispatcher = match &transport {
            Some(transport) => {
                let rx = transport.subscribe();
                Some(tokio::spawn(dispatch(rx, origin.clone(), handlers.clone())))
            }
            None => {
                debug!(origin = %origin, "no broadcast transport, cross-tab sync disabled");
                None
            }
        };

        Self {
            origin,
            transport,
            handlers,
            dispatcher: Mutex::new(dispatcher),
            closed: AtomicBool::new(false),
        }
    }

    /// 所有操作都是空操作的服务
    pub fn disabled(origin: impl Into<String>) -> Self {
        Self::new(origin, None)
    }

    pub fn is_available(&self) -> bool {
        self.transport.is_some() && !self.closed.load(Ordering::SeqCst)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn send<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) {
        let Some(transport) = &self.transport else {
            return;
        };
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic, "failed to encode broadcast payload: {}", e);
                return;
            }
        };
        let delivered = transport.post(Envelope {
            topic: topic.to_string(),
            payload,
            origin: self.origin.clone(),
        });
        if !delivered {
            debug!(topic, "broadcast sent with no listeners");
        }
    }

    pub fn on<F>(&self, topic: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(topic.to_string(), Arc::new(handler));
    }

    /// 同 [`on`](Self::on)，但先解码 payload；格式错误的 payload 记录日志后丢弃
    pub fn on_typed<T, F>(&self, topic: &str, handler: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = topic.to_string();
        self.on(topic, move |value| match serde_json::from_value::<T>(value) {
            Ok(payload) => handler(payload),
            Err(e) => warn!(topic = %name, "dropping malformed broadcast payload: {}", e),
        });
    }

    pub fn off(&self, topic: &str) {
        self.handlers.lock().unwrap().remove(topic);
    }

    /// 停止收发，可重复调用
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.dispatcher.lock().unwrap().take() {
            task.abort();
        }
        self.handlers.lock().unwrap().clear();
    }
}

impl Drop for BroadcastService {
    fn drop(&mut self) {
        if let Ok(dispatcher) = self.dispatcher.get_mut() {
            if let Some(task) = dispatcher.take() {
                task.abort();
            }
        }
    }
}

async fn dispatch(
    mut rx: tokio::sync::broadcast::Receiver<Envelope>,
    origin: String,
    handlers: Handlers,
) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if envelope.origin == origin {
                    continue;
                }
                let handler = handlers.lock().unwrap().get(&envelope.topic).cloned();
                match handler {
                    Some(handler) => handler(envelope.payload),
                    None => debug!(topic = %envelope.topic, "no handler for broadcast topic"),
                }
            }
            Err(RecvError::Lagged(lost)) => {
                debug!(origin = %origin, lost, "broadcast receiver lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
