//! Timer capability shared by every component.
//!
//! Components never call `tokio::time` directly for their reconnect, heartbeat,
//! renewal, and emission timers; they go through [`Scheduler`] and keep the
//! returned [`TimerHandle`]. Dropping or cancelling the handle before the timer
//! fires guarantees the task never runs.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`.
    fn after(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle;

    /// Run `tick` every `period`, first run one period from now.
    fn every(&self, period: Duration, tick: Box<dyn FnMut() + Send>) -> TimerHandle;
}

/// Cancellable handle to a scheduled timer. Cancels on drop.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Scheduler backed by the ambient tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            // Once fired the task runs to completion even if its handle is
            // dropped from inside the task.
            task.await;
        });
        TimerHandle::new(token)
    }

    fn every(&self, period: Duration, mut tick: Box<dyn FnMut() + Send>) -> TimerHandle {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // consume first immediate tick
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => tick(),
                }
            }
        });
        TimerHandle::new(token)
    }
}
