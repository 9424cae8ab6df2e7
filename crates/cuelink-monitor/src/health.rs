//! Connection health state machine.
//!
//! Levels are evaluated in fixed priority order, first match wins:
//! DISCONNECTED, STALE, NO_SIGNAL, DEGRADED, HEALTHY. Anything unmatched is
//! DEGRADED.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cuelink_core::envelope::{HeartbeatPayload, PipelineState};
use cuelink_core::{Clock, Scheduler, Subscribers, Subscription, TimerHandle};

/// Expected backend heartbeat period.
pub const HEARTBEAT_INTERVAL_MS: i64 = 3_000;
/// Silence after which a connected link is STALE.
pub const HEARTBEAT_TIMEOUT_MS: i64 = 2 * HEARTBEAT_INTERVAL_MS;
/// Age after which the last decoded frame counts as stale.
pub const FRAME_TIMEOUT_MS: i64 = 2_000;
/// Below this smoothed frame rate a running pipeline is DEGRADED.
pub const MIN_FPS: f64 = 10.0;
/// Periodic recheck so silence alone can move the level.
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLevel {
    #[default]
    Disconnected,
    Stale,
    NoSignal,
    Degraded,
    Healthy,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Stale => "STALE",
            Self::NoSignal => "NO_SIGNAL",
            Self::Degraded => "DEGRADED",
            Self::Healthy => "HEALTHY",
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot handed to subscribers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealthState {
    pub health: HealthLevel,
    pub last_heartbeat: i64,
    pub last_frame_ts: i64,
    pub ws_connected: bool,
    pub pipeline_state: PipelineState,
    pub fps_ewma: f64,
    /// Heartbeats in a row reporting a running pipeline with a fresh frame.
    pub consecutive_healthy_heartbeats: u32,
}

impl ConnectionHealthState {
    pub fn is_frame_stale(&self, now_ms: i64) -> bool {
        now_ms - self.last_frame_ts > FRAME_TIMEOUT_MS
    }
}

/// The level implied by `state` at `now_ms`. Ignores `state.health`.
pub fn derive_health(state: &ConnectionHealthState, now_ms: i64) -> HealthLevel {
    if !state.ws_connected {
        return HealthLevel::Disconnected;
    }
    if now_ms - state.last_heartbeat > HEARTBEAT_TIMEOUT_MS {
        return HealthLevel::Stale;
    }
    match state.pipeline_state {
        PipelineState::Error => HealthLevel::Stale,
        PipelineState::NoSignal => HealthLevel::NoSignal,
        PipelineState::Reconnecting => HealthLevel::Degraded,
        PipelineState::Running if state.fps_ewma >= MIN_FPS => HealthLevel::Healthy,
        PipelineState::Running => HealthLevel::Degraded,
        PipelineState::Unrecognized => HealthLevel::Degraded,
    }
}

pub struct HealthMonitor {
    clock: Arc<dyn Clock>,
    state: Mutex<ConnectionHealthState>,
    subscribers: Subscribers<ConnectionHealthState>,
    ticker: Mutex<Option<TimerHandle>>,
}

impl HealthMonitor {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(ConnectionHealthState::default()),
            subscribers: Subscribers::new(),
            ticker: Mutex::new(None),
        })
    }

    /// Start the once-per-second recheck. Restarting replaces the old ticker.
    pub fn start(self: &Arc<Self>, scheduler: &dyn Scheduler) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = scheduler.every(
            RECHECK_INTERVAL,
            Box::new(move || {
                if let Some(monitor) = weak.upgrade() {
                    monitor.recompute();
                }
            }),
        );
        *self.ticker.lock() = Some(handle);
    }

    pub fn update_ws_connection(&self, connected: bool) {
        self.state.lock().ws_connected = connected;
        self.recompute();
    }

    /// Ingest one backend heartbeat received at `timestamp_ms`.
    pub fn update_heartbeat(&self, timestamp_ms: i64, payload: &HeartbeatPayload) {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            state.last_heartbeat = timestamp_ms;
            state.last_frame_ts = payload.last_frame_ts;
            state.pipeline_state = payload.pipeline_state;
            state.fps_ewma = payload.fps_ewma;
            if !state.is_frame_stale(now) && payload.pipeline_state == PipelineState::Running {
                state.consecutive_healthy_heartbeats += 1;
            } else {
                state.consecutive_healthy_heartbeats = 0;
            }
        }
        self.recompute();
    }

    /// Re-derive the level; notifies subscribers only when it changed.
    pub fn recompute(&self) {
        let now = self.clock.now_ms();
        let changed = {
            let mut state = self.state.lock();
            let next = derive_health(&state, now);
            if next == state.health {
                None
            } else {
                let previous = state.health;
                state.health = next;
                state.consecutive_healthy_heartbeats = 0;
                Some((previous, state.clone()))
            }
        };
        match changed {
            Some((previous, snapshot)) => {
                info!(from = %previous, to = %snapshot.health, "health changed");
                self.subscribers.emit(&snapshot);
            }
            None => debug!("health unchanged"),
        }
    }

    pub fn state(&self) -> ConnectionHealthState {
        self.state.lock().clone()
    }

    pub fn health(&self) -> HealthLevel {
        self.state.lock().health
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&ConnectionHealthState) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribers.subscribe(handler)
    }

    /// Stop the recheck ticker and drop every subscriber.
    pub fn destroy(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.cancel();
        }
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cuelink_core::{ManualClock, TokioScheduler};
    use proptest::prelude::*;

    const NOW: i64 = 1_700_000_000_000;

    fn heartbeat(state: PipelineState, fps: f64) -> HeartbeatPayload {
        HeartbeatPayload {
            alive: true,
            last_frame_ts: NOW - 100,
            fps_ewma: fps,
            pipeline_state: state,
        }
    }

    fn monitor() -> (Arc<HealthMonitor>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        (HealthMonitor::new(clock.clone()), clock)
    }

    fn record(monitor: &HealthMonitor) -> Arc<Mutex<Vec<HealthLevel>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _ = monitor.subscribe(move |s| sink.lock().push(s.health));
        seen
    }

    #[test]
    fn starts_disconnected() {
        let (monitor, _) = monitor();
        assert_eq!(monitor.health(), HealthLevel::Disconnected);
        assert_eq!(monitor.state().pipeline_state, PipelineState::NoSignal);
    }

    #[test]
    fn connected_without_heartbeat_is_stale() {
        let (monitor, _) = monitor();
        monitor.update_ws_connection(true);
        assert_eq!(monitor.health(), HealthLevel::Stale);
    }

    #[test]
    fn priority_order() {
        let (monitor, _) = monitor();
        monitor.update_ws_connection(true);

        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, 30.0));
        assert_eq!(monitor.health(), HealthLevel::Healthy);

        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, 9.99));
        assert_eq!(monitor.health(), HealthLevel::Degraded);

        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Reconnecting, 30.0));
        assert_eq!(monitor.health(), HealthLevel::Degraded);

        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::NoSignal, 30.0));
        assert_eq!(monitor.health(), HealthLevel::NoSignal);

        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Error, 30.0));
        assert_eq!(monitor.health(), HealthLevel::Stale);

        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Unrecognized, 30.0));
        assert_eq!(monitor.health(), HealthLevel::Degraded);

        monitor.update_ws_connection(false);
        assert_eq!(monitor.health(), HealthLevel::Disconnected);
    }

    #[test]
    fn fps_threshold_is_inclusive() {
        let (monitor, _) = monitor();
        monitor.update_ws_connection(true);
        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, MIN_FPS));
        assert_eq!(monitor.health(), HealthLevel::Healthy);
    }

    #[test]
    fn silence_turns_stale_on_recompute() {
        let (monitor, clock) = monitor();
        monitor.update_ws_connection(true);
        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, 30.0));

        clock.advance(HEARTBEAT_TIMEOUT_MS);
        monitor.recompute();
        assert_eq!(monitor.health(), HealthLevel::Healthy, "timeout is exclusive");

        clock.advance(1);
        monitor.recompute();
        assert_eq!(monitor.health(), HealthLevel::Stale);
    }

    #[test]
    fn notifies_only_on_change() {
        let (monitor, _) = monitor();
        let seen = record(&monitor);
        monitor.update_ws_connection(true);
        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, 30.0));
        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, 25.0));
        monitor.update_ws_connection(true);
        monitor.recompute();
        assert_eq!(*seen.lock(), vec![HealthLevel::Stale, HealthLevel::Healthy]);
    }

    #[test]
    fn counts_consecutive_healthy_heartbeats() {
        let (monitor, _) = monitor();
        monitor.update_ws_connection(true);
        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, 30.0));
        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, 30.0));
        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, 30.0));
        // The first heartbeat's increment is reset by the STALE -> HEALTHY transition.
        assert_eq!(monitor.state().consecutive_healthy_heartbeats, 2);

        let mut stale_frame = heartbeat(PipelineState::Running, 30.0);
        stale_frame.last_frame_ts = NOW - FRAME_TIMEOUT_MS - 1;
        monitor.update_heartbeat(NOW, &stale_frame);
        assert_eq!(monitor.state().consecutive_healthy_heartbeats, 0);
        assert!(monitor.state().is_frame_stale(NOW));
    }

    #[test]
    fn destroy_releases_subscribers() {
        let (monitor, _) = monitor();
        let seen = record(&monitor);
        monitor.destroy();
        monitor.update_ws_connection(true);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_rechecks_every_second() {
        let (monitor, clock) = monitor();
        monitor.start(&TokioScheduler);
        monitor.update_ws_connection(true);
        monitor.update_heartbeat(NOW, &heartbeat(PipelineState::Running, 30.0));
        assert_eq!(monitor.health(), HealthLevel::Healthy);

        clock.advance(HEARTBEAT_TIMEOUT_MS + 500);
        tokio::time::advance(RECHECK_INTERVAL).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(monitor.health(), HealthLevel::Stale);
        monitor.destroy();
    }

    fn pipeline() -> impl Strategy<Value = PipelineState> {
        prop_oneof![
            Just(PipelineState::Running),
            Just(PipelineState::Reconnecting),
            Just(PipelineState::NoSignal),
            Just(PipelineState::Error),
            Just(PipelineState::Unrecognized),
        ]
    }

    proptest! {
        #[test]
        fn never_healthy_while_disconnected(
            pipeline in pipeline(),
            fps in 0.0f64..120.0,
            age in 0i64..20_000,
        ) {
            let state = ConnectionHealthState {
                ws_connected: false,
                last_heartbeat: NOW - age,
                pipeline_state: pipeline,
                fps_ewma: fps,
                ..Default::default()
            };
            prop_assert_eq!(derive_health(&state, NOW), HealthLevel::Disconnected);
        }

        #[test]
        fn low_fps_running_never_healthy(fps in 0.0f64..MIN_FPS) {
            let state = ConnectionHealthState {
                ws_connected: true,
                last_heartbeat: NOW,
                pipeline_state: PipelineState::Running,
                fps_ewma: fps,
                ..Default::default()
            };
            prop_assert_eq!(derive_health(&state, NOW), HealthLevel::Degraded);
        }
    }
}
