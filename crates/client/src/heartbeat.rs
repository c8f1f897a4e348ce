//! Heartbeat monitor — periodic latency probes and quality classification.
//!
//! While a connection is held, a probe runs every `heartbeat_interval`
//! with the interval itself as the response deadline: a probe that has
//! not answered by the next scheduled tick is a miss. Results feed a
//! fixed-capacity sliding window from which the discrete quality level is
//! recomputed after every probe; only an actual change in classification
//! is notified.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::events::EventDispatcher;
use crate::transport::Connection;
use crate::types::QualityLevel;

/// Latency below which a clean window classifies as excellent.
pub(crate) const LATENCY_EXCELLENT: Duration = Duration::from_millis(100);
/// Latency above which the link classifies as poor.
pub(crate) const LATENCY_NORMAL: Duration = Duration::from_millis(400);
/// Number of recent probes considered for classification.
pub(crate) const PROBE_WINDOW: usize = 10;

/// Outcome of one heartbeat probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    Ok(Duration),
    Miss,
}

/// Sliding window of recent probe outcomes, oldest → newest.
#[derive(Debug, Clone)]
pub(crate) struct ProbeWindow {
    buf: VecDeque<Probe>,
    capacity: usize,
}

impl ProbeWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a probe result, evicting the oldest when at capacity.
    pub(crate) fn push(&mut self, probe: Probe) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(probe);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    fn miss_count(&self) -> usize {
        self.buf.iter().filter(|p| **p == Probe::Miss).count()
    }

    fn last_two_missed(&self) -> bool {
        let mut it = self.buf.iter().rev();
        matches!(
            (it.next(), it.next()),
            (Some(Probe::Miss), Some(Probe::Miss))
        )
    }

    /// Latency of the most recent successful probe, if any.
    fn last_latency(&self) -> Option<Duration> {
        self.buf.iter().rev().find_map(|p| match p {
            Probe::Ok(latency) => Some(*latency),
            Probe::Miss => None,
        })
    }
}

/// Classifies link quality from the probe window. Assumes the connection
/// state is `Connected`; the disconnected case is handled before probing.
pub(crate) fn classify(window: &ProbeWindow) -> QualityLevel {
    if window.is_empty() {
        // No data yet, right after connect. Optimistic until the first
        // probe lands.
        return QualityLevel::Good;
    }
    if window.last_two_missed() {
        return QualityLevel::Poor;
    }
    match window.last_latency() {
        None => QualityLevel::Good,
        Some(latency) if latency > LATENCY_NORMAL => QualityLevel::Poor,
        Some(latency) if latency < LATENCY_EXCELLENT && window.miss_count() == 0 => {
            QualityLevel::Excellent
        }
        Some(_) => QualityLevel::Good,
    }
}

/// Shared heartbeat-derived health, read by `stats()` and the monitor.
pub(crate) struct HealthState {
    pub(crate) window: ProbeWindow,
    pub(crate) last_latency: Option<Duration>,
    pub(crate) quality: QualityLevel,
}

impl HealthState {
    pub(crate) fn new() -> Self {
        Self {
            window: ProbeWindow::new(PROBE_WINDOW),
            last_latency: None,
            quality: QualityLevel::Disconnected,
        }
    }
}

/// Updates the stored quality and notifies listeners only on an actual
/// change. The single entry point for quality transitions, so repeated
/// identical classifications never re-notify.
pub(crate) fn set_quality(
    health: &Mutex<HealthState>,
    dispatcher: &EventDispatcher,
    quality: QualityLevel,
) {
    let changed = match health.lock() {
        Ok(mut h) => {
            if h.quality == quality {
                false
            } else {
                h.quality = quality;
                true
            }
        }
        Err(_) => false,
    };
    if changed {
        debug!(?quality, "link quality changed");
        dispatcher.emit_quality(quality);
    }
}

/// Owns the recurring probe task for one connection generation.
pub(crate) struct HeartbeatMonitor {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Starts probing `conn` every `interval`. The first probe fires
    /// immediately so quality is established right after connect.
    pub(crate) fn start<C: Connection>(
        conn: Arc<C>,
        interval: Duration,
        verbose: bool,
        health: Arc<Mutex<HealthState>>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let probe = match tokio::time::timeout(interval, conn.ping()).await {
                            Ok(Ok(latency)) => Probe::Ok(latency),
                            Ok(Err(_)) | Err(_) => Probe::Miss,
                        };
                        if verbose {
                            trace!(?probe, "heartbeat probe");
                        }
                        let quality = match health.lock() {
                            Ok(mut h) => {
                                h.window.push(probe);
                                if let Probe::Ok(latency) = probe {
                                    h.last_latency = Some(latency);
                                }
                                classify(&h.window)
                            }
                            Err(_) => break,
                        };
                        set_quality(&health, &dispatcher, quality);
                    }
                }
            }
        });
        Self { cancel, handle }
    }

    /// Cancels the probe task and waits for it to wind down. A tick
    /// already past its ping runs to completion first, so no quality
    /// notification can arrive after this returns.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
        let _ = self.handle.await;
    }
}
