//! Backend relay link.
//!
//! The backend process holds the platform connections and streams events over a
//! Unix socket. Only the leader tab keeps the link open; followers see the same
//! state through the broadcast channel.

pub mod protocol;

#[cfg(unix)]
pub mod client;

pub use protocol::{status_update, RelayCommand, RelayEvent};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Consumer of relay events (the tab).
pub trait RelaySink: Send + Sync {
    fn on_relay_event(&self, event: RelayEvent);
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    LostLeadership,
    Closed,
    Failed(color_eyre::Report),
}

/// Keep a relay link open whenever `leader` reads true, until `shutdown` fires.
#[cfg(unix)]
pub async fn follow_leadership(
    path: PathBuf,
    config: RelayConfig,
    sink: Arc<dyn RelaySink>,
    mut leader: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let reconnect = Duration::from_millis(config.reconnect_ms);
    loop {
        loop {
            let is_leader = *leader.borrow_and_update();
            if is_leader {
                break;
            }
            tokio::select! {
                changed = leader.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }

        match session(&path, &config, sink.as_ref(), &mut leader, &mut shutdown).await {
            SessionEnd::Shutdown => return,
            SessionEnd::LostLeadership => {
                info!("relay link released, no longer leader");
                continue;
            }
            SessionEnd::Closed => warn!("relay closed the connection"),
            SessionEnd::Failed(e) => warn!("relay link failed: {:#}", e),
        }

        debug!(delay_ms = config.reconnect_ms, "relay reconnect scheduled");
        tokio::select! {
            _ = tokio::time::sleep(reconnect) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(not(unix))]
pub async fn follow_leadership(
    _path: PathBuf,
    _config: RelayConfig,
    _sink: Arc<dyn RelaySink>,
    _leader: watch::Receiver<bool>,
    _shutdown: watch::Receiver<bool>,
) {
    warn!("relay link is only supported on Unix (macOS/Linux)");
}

#[cfg(unix)]
async fn session(
    path: &std::path::Path,
    config: &RelayConfig,
    sink: &dyn RelaySink,
    leader: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    enum Step {
        Event(RelayEvent),
        Ping,
        End(SessionEnd),
    }

    let mut link = match client::RelayLink::connect(path).await {
        Ok(link) => link,
        Err(e) => return SessionEnd::Failed(e),
    };
    let subscribe = RelayCommand::Subscribe {
        platforms: config.platforms.clone(),
    };
    if let Err(e) = link.send(&subscribe).await {
        return SessionEnd::Failed(e);
    }
    info!(path = %path.display(), "relay link established");

    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        let step = tokio::select! {
            event = link.next_event() => match event {
                Ok(Some(event)) => Step::Event(event),
                Ok(None) => Step::End(SessionEnd::Closed),
                Err(e) => Step::End(SessionEnd::Failed(e)),
            },
            _ = ping.tick() => Step::Ping,
            changed = leader.changed() => {
                if changed.is_err() || !*leader.borrow_and_update() {
                    Step::End(SessionEnd::LostLeadership)
                } else {
                    continue;
                }
            }
            _ = shutdown.changed() => Step::End(SessionEnd::Shutdown),
        };

        match step {
            Step::Event(event) => sink.on_relay_event(event),
            Step::Ping => {
                if let Err(e) = link.send(&RelayCommand::Ping).await {
                    return SessionEnd::Failed(e);
                }
            }
            Step::End(end) => return end,
        }
    }
}
