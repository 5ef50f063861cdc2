//! Per-platform poll loop.
//!
//! Runs only on the leader tab. Connect failures are retried with linear backoff
//! (`min(attempt × initial_backoff_ms, max_backoff_ms)`) up to `max_retries`
//! attempts; a transient poll failure reconnects through the same path. Permanent
//! errors end the loop in the `error` state.

pub mod traits;

pub use traits::{AdapterError, AdapterEvent, PlatformAdapter, PollSink};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PollConfig;
use crate::platform::Platform;
use crate::store::ConnectionUpdate;

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(config: &PollConfig, attempt: u32) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(attempt as u64)
        .min(config.max_backoff_ms);
    Duration::from_millis(ms)
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct PollLoop {
    adapter: Arc<dyn PlatformAdapter>,
    sink: Arc<dyn PollSink>,
    config: PollConfig,
    running: Mutex<Option<Running>>,
}

impl PollLoop {
    pub fn new(adapter: Arc<dyn PlatformAdapter>, sink: Arc<dyn PollSink>, config: PollConfig) -> Self {
        Self {
            adapter,
            sink,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn platform(&self) -> Platform {
        self.adapter.platform()
    }

    /// Spawn the loop. No-op while it is already running; a finished loop restarts.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!(platform = %self.platform(), "poll loop already running");
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run(
            self.adapter.clone(),
            self.sink.clone(),
            self.config.clone(),
            rx,
        ));
        *running = Some(Running { shutdown, task });
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Cancel pending work, close the adapter, report `disconnected`. Idempotent.
    pub async fn disconnect(&self) {
        let running = self.running.lock().unwrap().take();
        let Some(running) = running else {
            return;
        };
        running.shutdown.send_replace(true);
        let _ = running.task.await;
        self.adapter.disconnect().await;
        self.sink
            .on_status(self.platform(), ConnectionUpdate::Disconnected);
        info!(platform = %self.platform(), "poll loop stopped");
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        if let Ok(running) = self.running.get_mut() {
            if let Some(running) = running.take() {
                running.task.abort();
            }
        }
    }
}

/// Sleep unless shutdown is signalled first. Returns false on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

async fn run(
    adapter: Arc<dyn PlatformAdapter>,
    sink: Arc<dyn PollSink>,
    config: PollConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let platform = adapter.platform();
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let mut attempt: u32 = 0;

    loop {
        sink.on_status(platform, ConnectionUpdate::Connecting);
        let connected = tokio::select! {
            r = adapter.connect() => r,
            _ = shutdown.changed() => return,
        };

        let failure = match connected {
            Ok(()) => {
                if attempt > 0 {
                    info!(%platform, attempt, "reconnected");
                } else {
                    info!(%platform, "connected");
                }
                attempt = 0;
                sink.on_status(platform, ConnectionUpdate::Connected);
                // 轮询直到出错或被取消
                loop {
                    let polled = tokio::select! {
                        r = adapter.poll() => r,
                        _ = shutdown.changed() => return,
                    };
                    match polled {
                        Ok(events) => {
                            for event in events {
                                sink.on_event(platform, event);
                            }
                        }
                        Err(e) => {
                            adapter.disconnect().await;
                            break e;
                        }
                    }
                    if !pause(poll_interval, &mut shutdown).await {
                        return;
                    }
                }
            }
            Err(e) => e,
        };

        match failure {
            AdapterError::Permanent(reason) => {
                error!(%platform, "adapter failed permanently: {}", reason);
                sink.on_status(platform, ConnectionUpdate::Error(reason));
                return;
            }
            AdapterError::Transient(reason) => {
                attempt += 1;
                sink.on_status(platform, ConnectionUpdate::Error(reason.clone()));
                if attempt >= config.max_retries {
                    error!(%platform, attempt, "giving up after repeated failures: {}", reason);
                    return;
                }
                let delay = backoff_delay(&config, attempt);
                warn!(
                    %platform,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "connection failed, retrying: {}",
                    reason
                );
                if !pause(delay, &mut shutdown).await {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::to_datetime;
    use crate::platform::IncomingMessage;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Script {
        connects: VecDeque<Result<(), AdapterError>>,
        polls: VecDeque<Result<Vec<AdapterEvent>, AdapterError>>,
        connect_calls: u32,
        disconnect_calls: u32,
    }

    struct FakeAdapter {
        script: Mutex<Script>,
    }

    impl FakeAdapter {
        fn new(
            connects: Vec<Result<(), AdapterError>>,
            polls: Vec<Result<Vec<AdapterEvent>, AdapterError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(Script {
                    connects: connects.into(),
                    polls: polls.into(),
                    ..Script::default()
                }),
            })
        }

        fn connect_calls(&self) -> u32 {
            self.script.lock().unwrap().connect_calls
        }
    }

    #[async_trait]
    impl PlatformAdapter for FakeAdapter {
        fn platform(&self) -> Platform {
            Platform::Telegram
        }

        async fn connect(&self) -> Result<(), AdapterError> {
            let mut s = self.script.lock().unwrap();
            s.connect_calls += 1;
            s.connects.pop_front().unwrap_or(Ok(()))
        }

        async fn poll(&self) -> Result<Vec<AdapterEvent>, AdapterError> {
            let next = self.script.lock().unwrap().polls.pop_front();
            match next {
                Some(r) => r,
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&self) {
            self.script.lock().unwrap().disconnect_calls += 1;
        }
    }

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<ConnectionUpdate>>,
        events: Mutex<Vec<AdapterEvent>>,
    }

    impl PollSink for Recorder {
        fn on_status(&self, _platform: Platform, update: ConnectionUpdate) {
            self.statuses.lock().unwrap().push(update);
        }

        fn on_event(&self, _platform: Platform, event: AdapterEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn config() -> PollConfig {
        PollConfig::default()
    }

    fn transient(reason: &str) -> AdapterError {
        AdapterError::Transient(reason.to_string())
    }

    fn new_message(content: &str) -> AdapterEvent {
        AdapterEvent::NewMessage(IncomingMessage::text(
            Platform::Telegram,
            "bob",
            content,
            to_datetime(0),
        ))
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let c = config();
        let delays: Vec<u64> = (1..=6)
            .map(|a| backoff_delay(&c, a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2_000, 4_000, 6_000, 8_000, 10_000, 10_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_events_after_connecting() {
        let adapter = FakeAdapter::new(vec![], vec![Ok(vec![new_message("a"), new_message("b")])]);
        let sink = Arc::new(Recorder::default());
        let poll = PollLoop::new(adapter.clone(), sink.clone(), config());

        poll.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(poll.is_running());
        assert_eq!(
            *sink.statuses.lock().unwrap(),
            vec![ConnectionUpdate::Connecting, ConnectionUpdate::Connected]
        );
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_back_off_then_give_up() {
        let failures = (0..5).map(|i| Err(transient(&format!("down {}", i)))).collect();
        let adapter = FakeAdapter::new(failures, vec![]);
        let sink = Arc::new(Recorder::default());
        let poll = PollLoop::new(adapter.clone(), sink.clone(), config());

        poll.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(adapter.connect_calls(), 1);

        // 2s 后第二次
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(adapter.connect_calls(), 2);

        // 4s + 6s + 8s 后第五次，随后放弃
        tokio::time::sleep(Duration::from_millis(18_000)).await;
        assert_eq!(adapter.connect_calls(), 5);
        assert!(!poll.is_running());
        assert_eq!(
            sink.statuses.lock().unwrap().last(),
            Some(&ConnectionUpdate::Error("down 4".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_stops_loop() {
        let adapter = FakeAdapter::new(
            vec![Err(AdapterError::Permanent("bad token".into()))],
            vec![],
        );
        let sink = Arc::new(Recorder::default());
        let poll = PollLoop::new(adapter.clone(), sink.clone(), config());

        poll.start();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(adapter.connect_calls(), 1);
        assert!(!poll.is_running());
        assert_eq!(
            sink.statuses.lock().unwrap().last(),
            Some(&ConnectionUpdate::Error("bad token".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_failure_reconnects() {
        let adapter = FakeAdapter::new(vec![], vec![Err(transient("timeout")), Ok(vec![new_message("x")])]);
        let sink = Arc::new(Recorder::default());
        let poll = PollLoop::new(adapter.clone(), sink.clone(), config());

        poll.start();
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        assert_eq!(adapter.connect_calls(), 2);
        assert_eq!(
            *sink.statuses.lock().unwrap(),
            vec![
                ConnectionUpdate::Connecting,
                ConnectionUpdate::Connected,
                ConnectionUpdate::Error("timeout".to_string()),
                ConnectionUpdate::Connecting,
                ConnectionUpdate::Connected,
            ]
        );
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry_and_is_idempotent() {
        let adapter = FakeAdapter::new(vec![Err(transient("down"))], vec![]);
        let sink = Arc::new(Recorder::default());
        let poll = PollLoop::new(adapter.clone(), sink.clone(), config());

        poll.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        poll.disconnect().await;
        poll.disconnect().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(adapter.connect_calls(), 1);
        assert!(!poll.is_running());
        let statuses = sink.statuses.lock().unwrap();
        assert_eq!(statuses.last(), Some(&ConnectionUpdate::Disconnected));
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == ConnectionUpdate::Disconnected)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_runs_one_loop() {
        let adapter = FakeAdapter::new(vec![], vec![]);
        let sink = Arc::new(Recorder::default());
        let poll = PollLoop::new(adapter.clone(), sink.clone(), config());

        poll.start();
        poll.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(adapter.connect_calls(), 1);

        poll.disconnect().await;
        poll.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(adapter.connect_calls(), 2);
    }
}
