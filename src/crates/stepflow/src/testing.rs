//! Deterministic workers for tests and dry runs

use crate::error::{Result, StepflowError};
use crate::execution::{WorkUnit, Worker};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Fails a fixed number of times, then echoes the description
#[derive(Debug, Default)]
pub struct FlakyWorker {
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyWorker {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for FlakyWorker {
    async fn perform(&self, work: &WorkUnit) -> Result<Value> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(StepflowError::Worker(format!(
                "transient failure {} of {}",
                attempt + 1,
                self.failures
            )));
        }
        Ok(Value::String(work.description.clone()))
    }
}

/// Always fails with the same message
#[derive(Debug, Clone)]
pub struct FailingWorker {
    message: String,
}

impl FailingWorker {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Worker for FailingWorker {
    async fn perform(&self, _work: &WorkUnit) -> Result<Value> {
        Err(StepflowError::Worker(self.message.clone()))
    }
}

/// Echoes the description and counts calls
#[derive(Debug, Default)]
pub struct CountingWorker {
    calls: AtomicUsize,
}

impl CountingWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for CountingWorker {
    async fn perform(&self, work: &WorkUnit) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Value::String(work.description.clone()))
    }
}

/// Sleeps before echoing and tracks peak concurrency
///
/// A description of the form `sleep:<ms>` overrides the delay for that unit.
#[derive(Debug, Default)]
pub struct SlowWorker {
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowWorker {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Highest number of simultaneous `perform` calls observed
    pub fn max_concurrent(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for SlowWorker {
    async fn perform(&self, work: &WorkUnit) -> Result<Value> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = work
            .description
            .strip_prefix("sleep:")
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::String(work.description.clone()))
    }
}
