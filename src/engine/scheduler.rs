//! Visibility and connectivity aware polling.
//!
//! A `PollingScheduler` calls its target's `refresh(false)` on a fixed
//! interval. The timer pauses while the host is hidden (unless the
//! consumer is continuous) or offline (always). When a paused consumer
//! becomes active again it gets exactly one forced refresh, then the
//! interval restarts from that point.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Something that can be refreshed on a schedule.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    /// `force` bypasses fresh cache entries.
    async fn refresh(&self, force: bool);
}

// ---------------------------------------------------------------------------
// Host environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostStatus {
    pub visible: bool,
    pub online: bool,
}

impl Default for HostStatus {
    fn default() -> Self {
        Self {
            visible: true,
            online: true,
        }
    }
}

/// Host capability interface. A signal the host cannot detect is treated
/// as permanently visible / online.
pub trait HostEnvironment: Send + Sync {
    fn can_detect_visibility(&self) -> bool;
    fn can_detect_online(&self) -> bool;
    fn watch(&self) -> watch::Receiver<HostStatus>;
}

/// Headless host: always visible, always online.
pub struct AlwaysVisible {
    tx: watch::Sender<HostStatus>,
}

impl AlwaysVisible {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HostStatus::default());
        Self { tx }
    }
}

impl Default for AlwaysVisible {
    fn default() -> Self {
        Self::new()
    }
}

impl HostEnvironment for AlwaysVisible {
    fn can_detect_visibility(&self) -> bool {
        false
    }
    fn can_detect_online(&self) -> bool {
        false
    }
    fn watch(&self) -> watch::Receiver<HostStatus> {
        self.tx.subscribe()
    }
}

/// Host whose signals are driven programmatically.
pub struct SimulatedHost {
    tx: watch::Sender<HostStatus>,
}

impl SimulatedHost {
    pub fn new(initial: HostStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set_visible(&self, visible: bool) {
        self.tx.send_modify(|s| s.visible = visible);
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_modify(|s| s.online = online);
    }

    pub fn status(&self) -> HostStatus {
        *self.tx.borrow()
    }
}

impl HostEnvironment for SimulatedHost {
    fn can_detect_visibility(&self) -> bool {
        true
    }
    fn can_detect_online(&self) -> bool {
        true
    }
    fn watch(&self) -> watch::Receiver<HostStatus> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
    /// Keep polling while hidden (live in-play feeds).
    pub continuous: bool,
    /// Issue a cache-respecting refresh as soon as polling starts.
    pub refresh_on_start: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            continuous: false,
            refresh_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    Idle,
    Polling,
    Paused,
}

#[derive(Debug, Clone, Copy)]
struct Capabilities {
    visibility: bool,
    online: bool,
    continuous: bool,
}

impl Capabilities {
    fn is_active(&self, status: HostStatus) -> bool {
        let online = !self.online || status.online;
        let visible = !self.visibility || status.visible || self.continuous;
        online && visible
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PollingScheduler {
    target: Weak<dyn RefreshTarget>,
    host: Arc<dyn HostEnvironment>,
    config: PollingConfig,
    state: Arc<Mutex<PollingState>>,
    running: Mutex<Option<Running>>,
}

impl PollingScheduler {
    /// The scheduler holds its target weakly and stops once it is dropped.
    pub fn new(
        target: Weak<dyn RefreshTarget>,
        host: Arc<dyn HostEnvironment>,
        config: PollingConfig,
    ) -> Self {
        Self {
            target,
            host,
            config,
            state: Arc::new(Mutex::new(PollingState::Idle)),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    pub fn state(&self) -> PollingState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Start the polling task. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let caps = Capabilities {
            visibility: self.host.can_detect_visibility(),
            online: self.host.can_detect_online(),
            continuous: self.config.continuous,
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.target.clone(),
            self.host.watch(),
            caps,
            self.config.clone(),
            Arc::clone(&self.state),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, handle });
        true
    }

    /// Stop polling. An in-progress refresh is abandoned.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
            *self.state.lock() = PollingState::Idle;
            info!("Polling stopped");
        }
    }

    /// Refresh immediately, outside the timer.
    pub async fn refresh(&self, force: bool) {
        if let Some(target) = self.target.upgrade() {
            target.refresh(force).await;
        }
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

/// Refresh the target unless cancelled first. Returns false when the loop
/// should exit.
async fn refresh_target(
    target: &Weak<dyn RefreshTarget>,
    force: bool,
    cancel: &CancellationToken,
) -> bool {
    let Some(target) = target.upgrade() else {
        debug!("Refresh target dropped, stopping poller");
        return false;
    };
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = target.refresh(force) => true,
    }
}

async fn run_loop(
    target: Weak<dyn RefreshTarget>,
    mut status_rx: watch::Receiver<HostStatus>,
    caps: Capabilities,
    config: PollingConfig,
    state: Arc<Mutex<PollingState>>,
    cancel: CancellationToken,
) {
    let mut active = caps.is_active(*status_rx.borrow_and_update());
    *state.lock() = if active { PollingState::Polling } else { PollingState::Paused };

    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_secs = config.interval.as_secs(),
        continuous = config.continuous,
        active,
        "Polling started"
    );

    if config.refresh_on_start && active && !refresh_target(&target, false, &cancel).await {
        return;
    }

    let mut watching = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = ticker.tick(), if active => {
                if !refresh_target(&target, false, &cancel).await {
                    break;
                }
            }

            changed = status_rx.changed(), if watching => {
                if changed.is_err() {
                    // Host went away; keep the last known status.
                    watching = false;
                    continue;
                }
                let status = *status_rx.borrow_and_update();
                let now_active = caps.is_active(status);

                if !active && now_active {
                    info!(visible = status.visible, online = status.online, "Polling resumed");
                    active = true;
                    *state.lock() = PollingState::Polling;
                    if !refresh_target(&target, true, &cancel).await {
                        break;
                    }
                    ticker.reset();
                } else if active && !now_active {
                    info!(visible = status.visible, online = status.online, "Polling paused");
                    active = false;
                    *state.lock() = PollingState::Paused;
                }
            }
        }
    }

    if !cancel.is_cancelled() {
        *state.lock() = PollingState::Idle;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
