//! Cancelable timer slots
//!
//! Every leg timer is a spawned task held in a slot so the destroy
//! transition can cancel it deterministically. A slot holds at most one
//! task; arming replaces whatever was there.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct TimerSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the slot: after `delay`, run `task`. Replaces and cancels any
    /// previously armed timer. The task must re-validate state when it
    /// fires; cancellation is best-effort and a fire can race the state
    /// change that would have canceled it.
    pub fn arm<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        self.replace(Some(handle));
    }

    /// Arm a repeating timer that runs `tick` every `interval`
    pub fn arm_interval<F, Fut>(&self, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                tick().await;
            }
        });
        self.replace(Some(handle));
    }

    pub fn cancel(&self) {
        self.replace(None);
    }

    fn replace(&self, new: Option<JoinHandle<()>>) {
        let mut slot = self.handle.lock().unwrap();
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = new;
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
