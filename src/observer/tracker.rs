//! Live progress tracking of one scan.
//!
//! # Task Layout
//! ```text
//! snapshot forwarder ─┐
//! broadcast forwarder ├─ wake ──→ reconciler ── fetch_progress ──→ TrackerView
//! poller ─────────────┘
//! heartbeat ── stale push channel + poller stopped ──→ respawn poller
//! ```
//!
//! Every task of a tracked scan lives in one `SessionHandle`; dropping the
//! handle aborts them all. Tasks carry the generation they were spawned for
//! and do nothing once a newer session (or a clear) has replaced it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::ObserverConfig;
use crate::observer::pointer::{PointerError, PointerStore};
use crate::observer::reconcile::{fetch_progress, settle};
use crate::observer::signals::{ClientScanPointer, ConnectionStatus, PushMessage, ScanProgress};
use crate::observer::source::{ProgressSource, PushFeed};

/// What the host renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerView {
    pub active_scan: Option<ClientScanPointer>,
    pub progress: Option<ScanProgress>,
    pub is_minimized: bool,
    pub connection_status: ConnectionStatus,
}

impl TrackerView {
    fn is_terminal(&self) -> bool {
        self.progress.as_ref().is_some_and(|p| p.is_terminal)
    }
}

/// All tasks of one tracked scan. Dropping it aborts every one of them.
#[derive(Default)]
pub struct SessionHandle {
    tasks: Vec<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl SessionHandle {
    fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    fn set_poller(&mut self, poller: JoinHandle<()>) {
        if let Some(old) = self.poller.replace(poller) {
            old.abort();
        }
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }

    fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.stop_poller();
    }
}

struct TrackerState {
    generation: u64,
    view: TrackerView,
    last_update: Instant,
    session: Option<SessionHandle>,
}

struct Inner {
    source: Arc<dyn ProgressSource>,
    feed: Option<Arc<dyn PushFeed>>,
    pointers: Arc<dyn PointerStore>,
    config: ObserverConfig,
    state: Mutex<TrackerState>,
    views: watch::Sender<TrackerView>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &TrackerState) {
        self.views.send_if_modified(|shown| {
            if *shown == state.view {
                return false;
            }
            *shown = state.view.clone();
            true
        });
    }

    /// Drop the current session. With `only_generation` set, only when that
    /// session is still the current one.
    fn clear(&self, only_generation: Option<u64>) {
        let released = {
            let mut state = self.lock();
            if only_generation.is_some_and(|g| g != state.generation) {
                return;
            }
            state.generation += 1;
            state.view = TrackerView {
                connection_status: ConnectionStatus::Disconnected,
                ..TrackerView::default()
            };
            self.publish(&state);
            // Under the lock, so a concurrent start_tracking saves after us.
            if let Err(e) = self.pointers.clear() {
                tracing::warn!(error = %e, "Failed to clear persisted scan pointer");
            }
            state.session.take()
        };
        drop(released);
    }
}

/// Keeps one scan's progress view converging on the truth.
#[derive(Clone)]
pub struct ScanTracker {
    inner: Arc<Inner>,
}

impl ScanTracker {
    /// A tracker reading from `source`. Without a `feed` it runs on
    /// polling alone.
    pub fn new(
        source: Arc<dyn ProgressSource>,
        feed: Option<Arc<dyn PushFeed>>,
        pointers: Arc<dyn PointerStore>,
        config: ObserverConfig,
    ) -> Self {
        let (views, _) = watch::channel(TrackerView::default());
        Self {
            inner: Arc::new(Inner {
                source,
                feed,
                pointers,
                config,
                state: Mutex::new(TrackerState {
                    generation: 0,
                    view: TrackerView::default(),
                    last_update: Instant::now(),
                    session: None,
                }),
                views,
            }),
        }
    }

    pub fn view(&self) -> TrackerView {
        self.inner.lock().view.clone()
    }

    /// Receiver that sees every view change.
    pub fn subscribe(&self) -> watch::Receiver<TrackerView> {
        self.inner.views.subscribe()
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .lock()
            .session
            .as_ref()
            .is_some_and(SessionHandle::is_polling)
    }

    /// Track `pointer`, tearing down whatever was tracked before.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_tracking(&self, pointer: ClientScanPointer) {
        let config = &self.inner.config;
        let previous = {
            let mut state = self.inner.lock();
            if let Err(e) = self.inner.pointers.save(&pointer) {
                tracing::warn!(scan_id = %pointer.scan_id, error = %e, "Failed to persist scan pointer");
            }
            state.generation += 1;

            let (wake, wakes) = mpsc::channel(1);
            let ctx = SessionCtx {
                tracker: Arc::downgrade(&self.inner),
                generation: state.generation,
                scan_id: pointer.scan_id.clone(),
                wake,
            };

            let mut session = SessionHandle::default();
            session.push(tokio::spawn(reconcile_loop(ctx.clone(), wakes)));
            session.set_poller(tokio::spawn(poll_loop(ctx.clone(), ms(config.poll_interval_ms))));
            session.push(tokio::spawn(heartbeat_loop(
                ctx.clone(),
                ms(config.heartbeat_interval_ms),
                ms(config.stale_after_ms),
            )));
            let connection_status = match &self.inner.feed {
                Some(feed) => {
                    for channel in [PushChannel::Snapshot, PushChannel::Broadcast] {
                        session.push(tokio::spawn(forward_push(ctx.clone(), feed.clone(), channel)));
                    }
                    ConnectionStatus::Connecting
                }
                None => ConnectionStatus::Disconnected,
            };

            state.view = TrackerView {
                active_scan: Some(pointer.clone()),
                progress: None,
                is_minimized: false,
                connection_status,
            };
            state.last_update = Instant::now();
            let previous = state.session.replace(session);
            self.inner.publish(&state);
            previous
        };
        drop(previous);

        tracing::info!(scan_id = %pointer.scan_id, scan_type = %pointer.scan_type, "Tracking scan");
    }

    /// Stop tracking and forget the persisted pointer.
    pub fn clear_active_scan(&self) {
        self.inner.clear(None);
    }

    /// Flip the minimized flag, returning the new value.
    pub fn toggle_minimize(&self) -> bool {
        let mut state = self.inner.lock();
        state.view.is_minimized = !state.view.is_minimized;
        self.inner.publish(&state);
        state.view.is_minimized
    }

    /// Hand every view to `on_view` until no scan is tracked any more,
    /// which after a terminal status means the grace delay has passed and
    /// the pointer is gone.
    pub async fn follow(&self, mut on_view: impl FnMut(&TrackerView)) {
        let mut views = self.subscribe();
        loop {
            let view = views.borrow_and_update().clone();
            on_view(&view);
            if view.active_scan.is_none() || views.changed().await.is_err() {
                return;
            }
        }
    }

    /// Pick the persisted pointer back up after a restart.
    pub fn resume(&self) -> Result<Option<ClientScanPointer>, PointerError> {
        let pointer = self.inner.pointers.load()?;
        if let Some(pointer) = &pointer {
            self.start_tracking(pointer.clone());
        }
        Ok(pointer)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[derive(Debug, Clone, Copy)]
enum PushChannel {
    Snapshot,
    Broadcast,
}

/// What every task of a session carries.
#[derive(Clone)]
struct SessionCtx {
    tracker: Weak<Inner>,
    generation: u64,
    scan_id: String,
    wake: mpsc::Sender<()>,
}

impl SessionCtx {
    /// Run `f` against the state if this session is still current, then
    /// publish. `None` means the session is gone.
    fn with_state<R>(&self, f: impl FnOnce(&Inner, &mut TrackerState) -> R) -> Option<R> {
        let inner = self.tracker.upgrade()?;
        let mut state = inner.lock();
        if state.generation != self.generation {
            return None;
        }
        let result = f(&inner, &mut state);
        inner.publish(&state);
        Some(result)
    }

    /// Queue a reconciliation. A full channel already holds one.
    fn wake(&self) -> bool {
        !matches!(self.wake.try_send(()), Err(TrySendError::Closed(_)))
    }

    fn ensure_polling(&self, inner: &Inner, state: &mut TrackerState) {
        if state.view.is_terminal() {
            return;
        }
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if !session.is_polling() {
            tracing::debug!(scan_id = %self.scan_id, "Starting poller");
            session.set_poller(tokio::spawn(poll_loop(
                self.clone(),
                ms(inner.config.poll_interval_ms),
            )));
        }
    }

    fn on_push(&self, message: &PushMessage) -> bool {
        let wake = self.with_state(|inner, state| {
            if state.view.is_terminal() {
                return false;
            }
            state.view.connection_status = ConnectionStatus::Connected;
            state.last_update = Instant::now();
            if !inner.config.poll_while_connected {
                if let Some(session) = state.session.as_mut() {
                    session.stop_poller();
                }
            }
            true
        });
        match wake {
            Some(true) => {
                tracing::trace!(scan_id = %self.scan_id, ?message, "Push wake");
                self.wake()
            }
            Some(false) => true,
            None => false,
        }
    }

    fn on_push_error(&self) -> bool {
        self.with_state(|inner, state| {
            state.view.connection_status = ConnectionStatus::Disconnected;
            self.ensure_polling(inner, state);
        })
        .is_some()
    }

    /// Store a fetched progress. `Some(true)` once terminal.
    fn apply(&self, progress: ScanProgress) -> Option<bool> {
        self.with_state(|_, state| {
            let Some(next) = settle(state.view.progress.as_ref(), progress) else {
                return false;
            };
            let terminal = next.is_terminal;
            state.view.progress = Some(next);
            if terminal {
                if let Some(session) = state.session.as_mut() {
                    session.stop_poller();
                }
            }
            terminal
        })
    }
}

async fn reconcile_loop(ctx: SessionCtx, mut wakes: mpsc::Receiver<()>) {
    while wakes.recv().await.is_some() {
        let Some(source) = ctx.tracker.upgrade().map(|inner| inner.source.clone()) else {
            break;
        };

        let progress = match fetch_progress(source.as_ref(), &ctx.scan_id).await {
            Ok(progress) => progress,
            Err(e) => {
                tracing::warn!(scan_id = %ctx.scan_id, error = %e, "Progress fetch failed, retrying on next wake");
                continue;
            }
        };

        match ctx.apply(progress) {
            Some(true) => {
                finish(&ctx).await;
                break;
            }
            Some(false) => {}
            None => break,
        }
    }
}

async fn finish(ctx: &SessionCtx) {
    let Some(grace) = ctx.tracker.upgrade().map(|inner| ms(inner.config.clear_grace_ms)) else {
        return;
    };
    tracing::info!(scan_id = %ctx.scan_id, grace_ms = grace.as_millis() as u64, "Scan finished");

    time::sleep(grace).await;
    if let Some(inner) = ctx.tracker.upgrade() {
        inner.clear(Some(ctx.generation));
    }
}

async fn poll_loop(ctx: SessionCtx, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !ctx.wake() {
            break;
        }
    }
}

async fn heartbeat_loop(ctx: SessionCtx, period: Duration, stale_after: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let alive = ctx.with_state(|inner, state| {
            let polling = state.session.as_ref().is_some_and(SessionHandle::is_polling);
            if !polling && !state.view.is_terminal() && state.last_update.elapsed() > stale_after {
                tracing::warn!(
                    scan_id = %ctx.scan_id,
                    silent_ms = state.last_update.elapsed().as_millis() as u64,
                    "Push channel quiet, restarting polling"
                );
                ctx.ensure_polling(inner, state);
            }
        });
        if alive.is_none() {
            break;
        }
    }
}

async fn forward_push(ctx: SessionCtx, feed: Arc<dyn PushFeed>, channel: PushChannel) {
    let subscribed = match channel {
        PushChannel::Snapshot => feed.subscribe_snapshot(&ctx.scan_id).await,
        PushChannel::Broadcast => feed.subscribe_broadcast(&ctx.scan_id).await,
    };
    let mut stream = match subscribed {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(scan_id = %ctx.scan_id, ?channel, error = %e, "Subscription failed, polling");
            ctx.on_push_error();
            return;
        }
    };

    while let Some(item) = stream.recv().await {
        let alive = match item {
            Ok(message) => ctx.on_push(&message),
            Err(e) => {
                tracing::warn!(scan_id = %ctx.scan_id, ?channel, error = %e, "Subscription error, polling");
                ctx.on_push_error()
            }
        };
        if !alive {
            return;
        }
    }

    tracing::debug!(scan_id = %ctx.scan_id, ?channel, "Subscription closed");
    ctx.on_push_error();
}
