//! Health state and graceful drain of in-flight data requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tracing::debug;

/// Lifecycle of the HTTP surface: Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    /// Shutdown began. Data requests are refused while in-flight ones finish.
    Draining,
    Stopped,
}

impl HealthState {
    /// Lowercase name reported by the health endpoint.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }

    /// Whether new data requests are accepted.
    #[must_use]
    pub fn accepts_requests(self) -> bool {
        self == HealthState::Ready
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Shared by the server loop, the health probes and every data handler.
#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<HealthState>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Moves to `Draining`. Data handlers answer 503 from here on.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
        debug!(in_flight = self.in_flight_count(), "draining started");
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Counts one request as in flight until the guard drops, unwinding
    /// included.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no request is in flight, for at most `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` once drained. On timeout the
    /// state stays `Draining` and `false` is returned.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.in_flight.idle.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok();
        if drained {
            self.state.store(Arc::new(HealthState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop and wakes drain waiters when it
/// reaches zero.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_through_states() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        assert!(!controller.health_state().accepts_requests());

        controller.set_ready();
        assert!(controller.health_state().accepts_requests());

        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(!controller.health_state().accepts_requests());
    }

    #[test]
    fn state_names() {
        assert_eq!(HealthState::Starting.as_str(), "starting");
        assert_eq!(HealthState::Draining.as_str(), "draining");
        assert_eq!(HealthState::Stopped.as_str(), "stopped");
    }

    #[test]
    fn guards_track_in_flight_requests() {
        let controller = ShutdownController::new();
        let first = controller.in_flight_guard();
        let second = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        drop(first);
        assert_eq!(controller.in_flight_count(), 1);
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn idle_server_drains_immediately() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        assert!(controller.wait_for_drain(Duration::from_millis(10)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn drain_waits_for_the_last_guard() {
        let controller = Arc::new(ShutdownController::new());
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_requests_outstanding() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();
        assert!(!controller.wait_for_drain(Duration::from_millis(20)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }
}
