//! Cancellable one-shot timers with generation tracking.
//!
//! A late firing can race with `cancel`/`arm`: the sleep task may already be
//! past its await when the owner cancels it. Each firing therefore carries
//! the generation it was armed with, and the owner accepts it only through
//! [`Timer::fire`] under its own lock.

use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct Timer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer. Any previous arming is cancelled.
    ///
    /// `on_fire` runs on a spawned task with the generation of this arming.
    pub fn arm<F>(&mut self, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(generation);
        }));
        generation
    }

    /// Cancel the timer. Cancelling a fired or never-armed timer is a no-op.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && self.generation == generation
    }

    /// Accept a firing. Returns `false` for stale generations; on `true` the
    /// timer is disarmed and may be re-armed by the caller.
    pub fn fire(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.task = None;
        self.generation = self.generation.wrapping_add(1);
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
