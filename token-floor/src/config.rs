//! Coordinator configuration.

use std::future::Future;
use std::time::Duration;

/// Sleep function trait for running under different runtimes (tokio vs
/// turmoil) and for driving tests on paused time.
pub trait Sleep: Clone + Send + 'static {
    /// Resolve after `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Tokio-based sleep implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleep;

impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Coordinator tuning knobs.
///
/// The grace window is how long a holder keeps the floor open after speech
/// stops (or after adopting the token without speaking) before the release
/// pass runs. It is a usability heuristic on top of the protocol, not part
/// of its correctness.
#[derive(Debug, Clone)]
pub struct FloorConfig<S: Sleep = TokioSleep> {
    /// Grace window before a quiet holder releases the floor.
    pub grace: Duration,
    /// Sleep implementation backing the grace window.
    pub sleep: S,
}

impl Default for FloorConfig<TokioSleep> {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(1500),
            sleep: TokioSleep,
        }
    }
}

impl<S: Sleep> FloorConfig<S> {
    /// Create a config with a custom grace window and sleep implementation.
    pub fn new(grace: Duration, sleep: S) -> Self {
        Self { grace, sleep }
    }
}
