// 每个集成测试文件只使用 MockAdapter 的部分方法，dead_code 为预期行为
#![allow(dead_code)]

//! 测试专用 MockAdapter
//!
//! 实现 PlatformAdapter trait。`push` 把事件放进待投递队列，
//! 下一次 poll 时一次性取走；队列为空时 poll 返回空批次。
//! `fail_next_connects` 让接下来的若干次 connect 返回 Transient 错误。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use notifier_hub::platform::{IncomingMessage, Platform};
use notifier_hub::poller::{AdapterError, AdapterEvent, PlatformAdapter};

pub struct MockAdapter {
    platform: Platform,
    pending: Mutex<VecDeque<AdapterEvent>>,
    connect_failures: AtomicU32,
    connects: AtomicU32,
    polls: AtomicU32,
    connected: AtomicBool,
}

impl MockAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            pending: Mutex::new(VecDeque::new()),
            connect_failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            connected: AtomicBool::new(false),
        }
    }

    pub fn push(&self, event: AdapterEvent) {
        self.pending.lock().unwrap().push_back(event);
    }

    pub fn push_message(&self, message: IncomingMessage) {
        self.push(AdapterEvent::NewMessage(message));
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AdapterError::Transient("mock connect refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<AdapterEvent>, AdapterError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pending.lock().unwrap().drain(..).collect())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
