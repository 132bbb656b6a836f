//! Sleep abstraction
//!
//! Every wait in the engines (head polling, backoff, rate-limit pauses)
//! goes through [`Sleeper`] so tests can observe the schedule without
//! waiting in real time.

use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested duration.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSleeper {
    slept: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

/// Records durations like [`RecordingSleeper`] but parks forever once
/// `limit` sleeps were requested, so an endless loop can be stopped.
///
/// An optional sampler is read at every sleep, e.g. to watch store state
/// between iterations.
#[cfg(test)]
pub(crate) struct StoppingSleeper {
    slept: std::sync::Mutex<Vec<(Duration, u64)>>,
    limit: usize,
    sample: Box<dyn Fn() -> u64 + Send + Sync>,
    stopped: tokio::sync::Notify,
}

#[cfg(test)]
impl StoppingSleeper {
    pub fn sampling(limit: usize, sample: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            slept: std::sync::Mutex::new(Vec::new()),
            limit,
            sample: Box::new(sample),
            stopped: tokio::sync::Notify::new(),
        }
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().iter().map(|(duration, _)| *duration).collect()
    }

    /// Sampler values, one per sleep.
    pub fn samples(&self) -> Vec<u64> {
        self.slept.lock().unwrap().iter().map(|(_, sample)| *sample).collect()
    }

    /// Resolves once the limit is reached.
    pub async fn stopped(&self) {
        self.stopped.notified().await;
    }
}

#[cfg(test)]
#[async_trait]
impl Sleeper for StoppingSleeper {
    async fn sleep(&self, duration: Duration) {
        let sample = (self.sample)();
        let count = {
            let mut slept = self.slept.lock().unwrap();
            slept.push((duration, sample));
            slept.len()
        };
        if count >= self.limit {
            self.stopped.notify_one();
            std::future::pending::<()>().await;
        }
    }
}
