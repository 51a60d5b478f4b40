//! # SwarmSync Runtime
//!
//! Async runtime abstractions for SwarmSync.
//!
//! Every component that waits (round polling, group-formation retries,
//! store backoff) goes through [`SwarmRuntime`] instead of calling Tokio
//! directly, so tests can drive the whole stack on a virtual clock:
//! - **Tokio**: wall-clock time for real deployments
//! - **Mock**: virtual time that advances only when something sleeps
//!
//! ## Feature Flags
//!
//! - `tokio` (default): Use Tokio runtime

use core::future::Future;
use core::time::Duration;

/// Runtime trait for async operations
pub trait SwarmRuntime: Send + Sync + 'static {
    /// Current time in milliseconds
    fn now(&self) -> u64;

    /// Sleep for the specified duration
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Spawn a background task
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Time elapsed since `start_ms`, saturating at zero
    fn elapsed_since(&self, start_ms: u64) -> Duration {
        Duration::from_millis(self.now().saturating_sub(start_ms))
    }
}

#[cfg(feature = "tokio")]
pub mod tokio_runtime {
    //! Tokio-based runtime implementation

    use super::*;

    /// Tokio runtime wrapper
    #[derive(Debug, Clone, Default)]
    pub struct TokioRuntime;

    impl TokioRuntime {
        /// Create a new Tokio runtime wrapper
        pub fn new() -> Self {
            Self
        }
    }

    impl SwarmRuntime for TokioRuntime {
        fn now(&self) -> u64 {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }

        fn spawn<F>(&self, future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            tokio::spawn(future);
        }
    }
}

/// Virtual-time runtime for tests and simulation
pub mod mock_runtime {
    use super::*;

    use core::pin::Pin;
    use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use core::task::{Context, Poll};
    use std::sync::Arc;

    /// Runtime whose clock only moves when a task sleeps or [`MockRuntime::advance`] is called.
    ///
    /// Clones share one clock, so several simulated peers observe the same
    /// time. `sleep` advances the clock by the requested duration and then
    /// yields once, letting other tasks on the executor make progress.
    #[derive(Debug, Clone, Default)]
    pub struct MockRuntime {
        current_time_ms: Arc<AtomicU64>,
        spawned: Arc<AtomicUsize>,
    }

    impl MockRuntime {
        /// Create a new mock runtime at time zero
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a mock runtime starting at `start_ms`
        pub fn starting_at(start_ms: u64) -> Self {
            let rt = Self::default();
            rt.current_time_ms.store(start_ms, Ordering::SeqCst);
            rt
        }

        /// Advance the mock clock
        pub fn advance(&self, duration: Duration) {
            self.current_time_ms
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }

        /// Number of tasks handed to [`SwarmRuntime::spawn`]
        pub fn spawned(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }
    }

    impl SwarmRuntime for MockRuntime {
        fn now(&self) -> u64 {
            self.current_time_ms.load(Ordering::SeqCst)
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
            YieldNow { yielded: false }.await;
        }

        fn spawn<F>(&self, future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            #[cfg(feature = "tokio")]
            tokio::spawn(future);
            #[cfg(not(feature = "tokio"))]
            drop(future);
        }
    }

    /// Returns `Pending` exactly once
    struct YieldNow {
        yielded: bool,
    }

    impl Future for YieldNow {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                return Poll::Ready(());
            }
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Get the default runtime based on features
#[cfg(feature = "tokio")]
pub fn default_runtime() -> tokio_runtime::TokioRuntime {
    tokio_runtime::TokioRuntime::new()
}

#[cfg(test)]
mod tests {
    use super::mock_runtime::MockRuntime;
    use super::*;

    #[tokio::test]
    async fn mock_sleep_advances_virtual_clock() {
        let rt = MockRuntime::new();
        rt.sleep(Duration::from_secs(3)).await;
        assert_eq!(rt.now(), 3_000);
        assert_eq!(rt.elapsed_since(1_000), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn clones_share_one_clock() {
        let rt = MockRuntime::starting_at(500);
        let other = rt.clone();
        other.advance(Duration::from_millis(250));
        assert_eq!(rt.now(), 750);
    }

    #[tokio::test]
    async fn elapsed_since_saturates() {
        let rt = MockRuntime::new();
        assert_eq!(rt.elapsed_since(10_000), Duration::ZERO);
    }

    #[tokio::test]
    async fn mock_spawn_runs_on_tokio() {
        let rt = MockRuntime::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        rt.spawn(async move {
            let _ = tx.send(7u8);
        });
        assert_eq!(rx.await.ok(), Some(7));
        assert_eq!(rt.spawned(), 1);
    }

    #[tokio::test]
    async fn tokio_runtime_reports_wall_clock() {
        let rt = default_runtime();
        assert!(rt.now() > 0);
    }
}
