use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::profile::LimitKind;
use crate::service::FailoverService;
use crate::usage::UsageChecker;

/// Proactive-swap candidate raised when the active profile crosses a
/// configured usage threshold. The monitor only recommends; acting on the
/// signal is the consumer's call (via `FailoverService::apply_proactive_swap`).
#[derive(Debug, Clone, PartialEq)]
pub enum SwapSignal {
    Capacity {
        profile_id: String,
        window: LimitKind,
        percent: f64,
    },
}

/// Tick scheduling state for the monitor loop.
///
/// Tracks a single next-due instant so at most one refresh is due at a time;
/// a straggling refresh pushes the following one out instead of overlapping.
/// An `interval` of `None` (polling disabled) disarms the schedule, so
/// re-enabling later starts a fresh full interval instead of firing at once.
#[derive(Debug, Default, Clone)]
pub struct TickSchedule {
    next_due: Option<Instant>,
}

impl TickSchedule {
    pub fn new() -> Self {
        Self { next_due: None }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    pub fn tick(&mut self, now: Instant, interval: Option<Duration>) -> bool {
        let Some(interval) = interval else {
            self.next_due = None;
            return false;
        };
        match self.next_due {
            None => {
                self.next_due = Some(now + interval);
                false
            }
            Some(due) if now >= due => {
                self.next_due = Some(now + interval);
                true
            }
            Some(_) => false,
        }
    }
}

/// Recurring background refresh of per-profile usage snapshots.
///
/// One task, one tick in flight; the interval is re-read from the store every
/// pass so settings changes (including disabling via 0) take effect without a
/// restart. Stop is idempotent and safe to call without a prior start; an
/// in-flight check may finish, but no new tick is scheduled after stop.
pub struct UsageMonitor {
    handle: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl UsageMonitor {
    pub fn new() -> Self {
        Self {
            handle: None,
            shutdown: None,
        }
    }

    pub fn start(
        &mut self,
        service: Arc<FailoverService>,
        checker: Arc<dyn UsageChecker>,
        signals: mpsc::UnboundedSender<SwapSignal>,
    ) {
        if self.handle.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut schedule = TickSchedule::new();
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                // The sleep arm can win the race against a shutdown that is
                // already pending; no tick may run once stop was requested.
                if *shutdown_rx.borrow() {
                    break;
                }

                let interval_secs = service.auto_switch_settings().usage_check_interval_secs;
                let interval = (interval_secs != 0).then_some(Duration::from_secs(interval_secs));
                if schedule.tick(Instant::now(), interval) {
                    refresh_usage_once(&service, checker.as_ref(), &signals).await;
                }
            }
            tracing::debug!("Usage monitor stopped");
        });

        self.handle = Some(handle);
        self.shutdown = Some(shutdown_tx);
    }

    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // An in-flight check may finish; no new tick is scheduled after this.
            let _ = shutdown.send(true);
        }
        self.handle.take();
    }
}

impl Default for UsageMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UsageMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One monitor tick: refresh every profile's usage snapshot, then raise a
/// capacity signal if the active profile crossed a threshold. A failed check
/// is logged and leaves the previous snapshot in place; it never corrupts
/// state, only delays a swap.
pub async fn refresh_usage_once(
    service: &FailoverService,
    checker: &dyn UsageChecker,
    signals: &mpsc::UnboundedSender<SwapSignal>,
) {
    let data = service.snapshot();

    for profile in &data.profiles {
        match checker.check_usage(profile).await {
            Ok(reading) => {
                if let Err(err) = service.refresh_usage(&profile.id, reading.into_snapshot()) {
                    tracing::warn!(profile = %profile.name, error = %err, "Failed to store usage");
                }
            }
            Err(err) => {
                tracing::warn!(profile = %profile.name, error = %err, "Usage check failed");
            }
        }
    }

    let settings = service.auto_switch_settings();
    if !settings.enabled || !settings.proactive_monitoring {
        return;
    }

    let data = service.snapshot();
    let Some(active_id) = data.active_profile.clone() else {
        return;
    };
    let Some(active) = data.profile(&active_id) else {
        return;
    };
    let Some(usage) = &active.usage else {
        return;
    };

    if let Some(percent) = usage.session_percent {
        if percent >= settings.session_threshold_percent {
            let _ = signals.send(SwapSignal::Capacity {
                profile_id: active_id.clone(),
                window: LimitKind::Session,
                percent,
            });
            return;
        }
    }
    if let Some(percent) = usage.weekly_percent {
        if percent >= settings.weekly_threshold_percent {
            let _ = signals.send(SwapSignal::Capacity {
                profile_id: active_id,
                window: LimitKind::Weekly,
                percent,
            });
        }
    }
}
