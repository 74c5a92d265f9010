//! Digit collection
//!
//! Accumulates out-of-band digits into a per-leg buffer and resolves the
//! single outstanding wait as soon as the buffer matches the requested
//! pattern. A new wait displaces the previous one (last caller wins); the
//! buffer itself is only cleared on explicit request.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

struct Waiter {
    pattern: String,
    generation: u64,
    tx: oneshot::Sender<Option<String>>,
}

#[derive(Default)]
struct Inner {
    buffer: String,
    waiter: Option<Waiter>,
    generation: u64,
}

#[derive(Default)]
pub struct DigitCollector {
    inner: Mutex<Inner>,
}

impl DigitCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a digit, resolving the outstanding wait on a match
    pub fn push(&self, digit: char) {
        let mut inner = self.inner.lock().unwrap();
        inner.buffer.push(digit);
        let matched = inner
            .waiter
            .as_ref()
            .map(|w| inner.buffer.contains(&w.pattern))
            .unwrap_or(false);
        if matched {
            if let Some(waiter) = inner.waiter.take() {
                let _ = waiter.tx.send(Some(waiter.pattern));
            }
        }
    }

    pub fn buffer(&self) -> String {
        self.inner.lock().unwrap().buffer.clone()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().buffer.clear();
    }

    /// Resolve any outstanding wait with an absent value (teardown path)
    pub fn abort_wait(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(waiter) = inner.waiter.take() {
            let _ = waiter.tx.send(None);
        }
    }

    /// Wait until the accumulated buffer matches `pattern` or the timeout
    /// elapses. A second wait issued while one is pending resolves the
    /// first immediately with an absent value.
    pub async fn wait_for(&self, pattern: &str, timeout: Duration) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        let generation;
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(previous) = inner.waiter.take() {
                let _ = previous.tx.send(None);
            }
            if inner.buffer.contains(pattern) {
                return Some(pattern.to_string());
            }
            inner.generation += 1;
            generation = inner.generation;
            inner.waiter = Some(Waiter {
                pattern: pattern.to_string(),
                generation,
                tx,
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped or timeout: clean up our waiter if it is
            // still the one installed
            _ => {
                let mut inner = self.inner.lock().unwrap();
                if inner
                    .waiter
                    .as_ref()
                    .map(|w| w.generation == generation)
                    .unwrap_or(false)
                {
                    inner.waiter = None;
                }
                None
            }
        }
    }
}
