//! Hierarchical progress reporting with cooperative cancellation.
//!
//! A run owns a root [`ProgressMonitor`] covering the whole `0.0..=1.0`
//! range. Phases and chunks get sub-monitors holding a fraction of their
//! parent's weight; each reports its own local progress and the shared
//! total is updated by the weighted delta.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution cancelled")]
pub struct Cancelled;

/// Receives overall progress updates.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, fraction: f64, message: Option<&str>);
}

impl<F> ProgressListener for F
where
    F: Fn(f64, Option<&str>) + Send + Sync,
{
    fn on_progress(&self, fraction: f64, message: Option<&str>) {
        self(fraction, message)
    }
}

/// An `f64` stored as bits in an `AtomicU64`.
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn swap(&self, value: f64) -> f64 {
        f64::from_bits(self.0.swap(value.to_bits(), Ordering::AcqRel))
    }

    fn add(&self, delta: f64) -> f64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(current) + delta).clamp(0.0, 1.0);
            match self.0.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[derive(Clone)]
pub struct ProgressMonitor {
    weight: f64,
    local: Arc<AtomicF64>,
    total: Arc<AtomicF64>,
    listener: Option<Arc<dyn ProgressListener>>,
    token: CancellationToken,
}

impl ProgressMonitor {
    pub fn new(listener: Option<Arc<dyn ProgressListener>>) -> Self {
        Self::with_token(listener, CancellationToken::new())
    }

    /// A root monitor cancelled through an externally owned token.
    pub fn with_token(listener: Option<Arc<dyn ProgressListener>>, token: CancellationToken) -> Self {
        Self {
            weight: 1.0,
            local: Arc::new(AtomicF64::default()),
            total: Arc::new(AtomicF64::default()),
            listener,
            token,
        }
    }

    /// A root monitor nobody listens to.
    pub fn detached() -> Self {
        Self::new(None)
    }

    /// A child covering `fraction` of this monitor's weight. Cancelling this
    /// monitor cancels the child, not the other way round.
    pub fn sub(&self, fraction: f64) -> ProgressMonitor {
        ProgressMonitor {
            weight: self.weight * fraction.clamp(0.0, 1.0),
            local: Arc::new(AtomicF64::default()),
            total: self.total.clone(),
            listener: self.listener.clone(),
            token: self.token.child_token(),
        }
    }

    /// Set the local progress of this monitor (`0.0..=1.0`).
    pub fn set_progress(&self, fraction: f64) {
        self.report(fraction, None);
    }

    /// Set the local progress together with a status message.
    pub fn report(&self, fraction: f64, message: Option<&str>) {
        let fraction = fraction.clamp(0.0, 1.0);
        let previous = self.local.swap(fraction);
        let total = self.total.add((fraction - previous) * self.weight);
        if let Some(listener) = &self.listener {
            listener.on_progress(total, message);
        }
    }

    pub fn set_message(&self, message: &str) {
        if let Some(listener) = &self.listener {
            listener.on_progress(self.total.load(), Some(message));
        }
    }

    /// Local progress of this monitor.
    pub fn progress(&self) -> f64 {
        self.local.load()
    }

    /// Overall progress of the run this monitor belongs to.
    pub fn total(&self) -> f64 {
        self.total.load()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once this monitor (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::detached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_weighted_sub_progress() {
        let root = ProgressMonitor::detached();
        let write = root.sub(0.1);
        let exec = root.sub(0.7);
        write.set_progress(1.0);
        assert!(close(root.total(), 0.1));

        let chunks: Vec<_> = (0..2).map(|_| exec.sub(0.5)).collect();
        chunks[0].set_progress(1.0);
        chunks[1].set_progress(0.5);
        assert!(close(root.total(), 0.1 + 0.35 + 0.175));

        // Going back only moves by the delta.
        chunks[1].set_progress(0.0);
        assert!(close(root.total(), 0.45));
    }

    #[test]
    fn test_listener_receives_total() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn ProgressListener> =
            Arc::new(move |fraction: f64, message: Option<&str>| {
                sink.lock()
                    .unwrap()
                    .push((fraction, message.map(str::to_string)));
            });
        let root = ProgressMonitor::new(Some(listener));
        root.sub(0.5).report(1.0, Some("half"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(close(seen[0].0, 0.5));
        assert_eq!(seen[0].1.as_deref(), Some("half"));
    }

    #[test]
    fn test_cancellation_flows_down_only() {
        let root = ProgressMonitor::detached();
        let a = root.sub(0.5);
        let b = root.sub(0.5);
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!root.is_cancelled());

        root.cancel();
        assert!(b.is_cancelled());
        assert_eq!(b.check_cancelled(), Err(Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancellationToken::new();
        let root = ProgressMonitor::with_token(None, token.clone());
        let chunk = root.sub(0.25);
        let waiter = tokio::spawn(async move { chunk.cancelled().await });
        token.cancel();
        waiter.await.unwrap();
    }
}
