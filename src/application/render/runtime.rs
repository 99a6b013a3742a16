//! Coordination primitives shared by the orchestrator: named FIFO locks and
//! a deadline wrapper that never cancels the guarded operation.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::error::{FormulaError, ProcessingStage};
use crate::domain::options::SpeechEngineKind;

/// Exclusive lock over one non-reentrant resource.
///
/// Waiters are served strictly in arrival order. Holding the guard twice
/// from the same task deadlocks; release happens when the guard drops,
/// which covers error and timeout paths.
pub struct NamedLock {
    name: &'static str,
    inner: Mutex<()>,
    acquisitions: AtomicU64,
    releases: AtomicU64,
}

impl NamedLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(()),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait until the caller is the exclusive holder.
    pub async fn acquire(&self) -> LockGuard<'_> {
        let waiting_since = Instant::now();
        let guard = self.inner.lock().await;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        debug!(
            target = "mathgate::application::render::runtime",
            lock = self.name,
            waited_ms = waiting_since.elapsed().as_millis() as u64,
            "lock acquired"
        );
        LockGuard {
            lock: self,
            _guard: guard,
            acquired_at: Instant::now(),
        }
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Holdership of a [`NamedLock`]; dropping it hands the lock to the next waiter.
pub struct LockGuard<'a> {
    lock: &'a NamedLock,
    _guard: MutexGuard<'a, ()>,
    acquired_at: Instant,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.releases.fetch_add(1, Ordering::SeqCst);
        debug!(
            target = "mathgate::application::render::runtime",
            lock = self.lock.name,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "lock released"
        );
    }
}

/// The named locks of the service. Independent resources never share a lock.
pub struct ResourceLocks {
    pub engine: NamedLock,
    pub raster: NamedLock,
    sre: NamedLock,
    mathcat: NamedLock,
}

impl Default for ResourceLocks {
    fn default() -> Self {
        Self {
            engine: NamedLock::new("engine"),
            raster: NamedLock::new("raster"),
            sre: NamedLock::new("speech.sre"),
            mathcat: NamedLock::new("speech.mathcat"),
        }
    }
}

impl ResourceLocks {
    pub fn speech(&self, kind: SpeechEngineKind) -> &NamedLock {
        match kind {
            SpeechEngineKind::Sre => &self.sre,
            SpeechEngineKind::MathCat => &self.mathcat,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeadlineError {
    #[error("deadline elapsed")]
    Elapsed,
    #[error("guarded task aborted: {0}")]
    Aborted(String),
}

/// Race `operation` against `deadline`.
///
/// The operation runs as its own task. When the deadline wins, the task is
/// detached, not cancelled: it keeps running and any shared state it commits
/// later stays committed. Its eventual outcome is discarded.
pub async fn with_deadline<F, T>(deadline: Duration, operation: F) -> Result<T, DeadlineError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::spawn(operation);
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_error)) => Err(DeadlineError::Aborted(join_error.to_string())),
        Err(_) => Err(DeadlineError::Elapsed),
    }
}

/// [`with_deadline`] for fallible stage operations, mapped onto the error taxonomy.
pub async fn guarded<F, T>(
    stage: ProcessingStage,
    deadline: Duration,
    operation: F,
) -> Result<T, FormulaError>
where
    F: Future<Output = Result<T, FormulaError>> + Send + 'static,
    T: Send + 'static,
{
    match with_deadline(deadline, operation).await {
        Ok(result) => result,
        Err(DeadlineError::Elapsed) => Err(FormulaError::timeout(
            stage,
            u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        )),
        Err(DeadlineError::Aborted(message)) => Err(FormulaError::unexpected(format!(
            "{stage} task aborted: {message}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fast_operation_yields_its_outcome() {
        let result = with_deadline(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            7
        })
        .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out_but_still_completes() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let result = with_deadline(Duration::from_millis(100), async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;
        assert_eq!(result, Err(DeadlineError::Elapsed));
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_maps_timeout_to_stage() {
        let err = guarded(ProcessingStage::Engine, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, FormulaError>(())
        })
        .await
        .expect_err("deadline must win");
        assert_eq!(err, FormulaError::timeout(ProcessingStage::Engine, 50));
    }

    #[tokio::test]
    async fn guarded_reports_panics_as_unexpected() {
        let err = guarded(ProcessingStage::Raster, Duration::from_secs(1), async {
            if true {
                panic!("converter exploded");
            }
            Ok::<(), FormulaError>(())
        })
        .await
        .expect_err("panic must surface");
        assert!(matches!(err, FormulaError::Unexpected { .. }));
    }

    #[tokio::test]
    async fn lock_counts_acquisitions_and_releases() {
        let lock = NamedLock::new("test");
        {
            let _guard = lock.acquire().await;
            assert_eq!(lock.acquisitions(), 1);
            assert_eq!(lock.releases(), 0);
        }
        assert_eq!(lock.releases(), 1);
    }

    #[tokio::test]
    async fn speech_locks_are_distinct() {
        let locks = ResourceLocks::default();
        let _sre = locks.speech(SpeechEngineKind::Sre).acquire().await;
        let _mathcat = locks.speech(SpeechEngineKind::MathCat).acquire().await;
        let _engine = locks.engine.acquire().await;
        let _raster = locks.raster.acquire().await;
        assert_eq!(locks.speech(SpeechEngineKind::Sre).name(), "speech.sre");
    }
}
