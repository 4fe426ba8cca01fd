//! Network reachability, debounced.
//!
//! Raw observations come from two places: the periodic probe loop started by
//! [`ConnectivityMonitor::spawn`] and platform callbacks passed to
//! [`ConnectivityMonitor::report`]. Both feed one [`Debouncer`]; subscribers
//! are notified once per settled transition, never per observation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capabilities::ReachabilityProbe;
use crate::config::MonitorConfig;

/// Collapses flapping observations into settled values.
///
/// The first observation settles immediately. After that, a differing value
/// settles only once it has been observed continuously for the whole window;
/// seeing the settled value again cancels the pending change.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    settled: Option<bool>,
    candidate: Option<(bool, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            settled: None,
            candidate: None,
        }
    }

    pub fn settled(&self) -> Option<bool> {
        self.settled
    }

    /// Record an observation. Returns the new value if it settles now.
    pub fn observe(&mut self, value: bool, now: Instant) -> Option<bool> {
        match self.settled {
            None => {
                self.settled = Some(value);
                self.candidate = None;
                Some(value)
            }
            Some(current) if current == value => {
                self.candidate = None;
                None
            }
            Some(_) => {
                let since = match self.candidate {
                    Some((pending, since)) if pending == value => since,
                    _ => now,
                };
                self.candidate = Some((value, since));
                self.poll(now)
            }
        }
    }

    /// Settle the pending value if its window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        let (value, since) = self.candidate?;
        if now.saturating_duration_since(since) >= self.window {
            self.settled = Some(value);
            self.candidate = None;
            return Some(value);
        }
        None
    }

    /// When the pending value would settle, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.candidate.map(|(_, since)| since + self.window)
    }
}

pub struct ConnectivityMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    config: MonitorConfig,
    debouncer: Mutex<Debouncer>,
    state: watch::Sender<bool>,
    wake: Notify,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("online", &self.current())
            .field("config", &self.config)
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Starts offline until the first observation arrives.
    pub fn new(probe: Arc<dyn ReachabilityProbe>, config: MonitorConfig) -> Arc<Self> {
        let (state, _) = watch::channel(false);
        Arc::new(Self {
            probe,
            debouncer: Mutex::new(Debouncer::new(config.debounce)),
            config,
            state,
            wake: Notify::new(),
        })
    }

    /// Probe now, bounded by the probe timeout. A failed or hung probe reads
    /// as offline. The result is also fed to the debouncer.
    pub async fn is_online(&self) -> bool {
        let online = match tokio::time::timeout(self.config.probe_timeout, self.probe.probe()).await
        {
            Ok(Ok(online)) => online,
            Ok(Err(e)) => {
                debug!(error = %e, "Reachability probe failed");
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.probe_timeout.as_millis() as u64,
                    "Reachability probe timed out"
                );
                false
            }
        };
        self.observe(online);
        online
    }

    /// Last settled value; no I/O.
    pub fn current(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Feed a platform network event.
    pub fn report(&self, online: bool) {
        self.observe(online);
        self.wake.notify_one();
    }

    fn debouncer(&self) -> MutexGuard<'_, Debouncer> {
        // The debouncer holds plain data; a panic mid-update cannot break it.
        self.debouncer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn observe(&self, online: bool) {
        let settled = self.debouncer().observe(online, Instant::now());
        if let Some(value) = settled {
            self.publish(value);
        }
    }

    fn settle_pending(&self) {
        let settled = self.debouncer().poll(Instant::now());
        if let Some(value) = settled {
            self.publish(value);
        }
    }

    fn publish(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    /// Run the probe loop on the current tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> MonitorHandle {
        let monitor = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let deadline = monitor.debouncer().deadline();
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        monitor.is_online().await;
                    }
                    _ = monitor.wake.notified() => {}
                    _ = sleep_until(deadline) => {
                        monitor.settle_pending();
                    }
                }
            }
            debug!("Connectivity monitor stopped");
        });

        MonitorHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Owns the probe loop; dropping it stops the loop.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
