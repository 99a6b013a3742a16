//! Lifecycle of the shared rendering engine.
//!
//! Exactly one engine instance exists at a time. A request whose capability
//! signature differs from the loaded one triggers a full teardown and
//! rebuild with `core ∪ requested`; the previous signature is replaced, not
//! extended. Every (re)initialization publishes one shared ready future that
//! all waiting requests await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::mutex_lock;
use crate::domain::capability::CapabilitySignature;
use crate::domain::error::FormulaError;

use super::types::{EngineFactory, MathEngine};

const SOURCE: &str = "application::render::lifecycle";
const METRIC_ENGINE_INIT: &str = "mathgate_engine_initializations_total";

/// Completion signal of the current (re)initialization.
pub type EngineReady = Shared<BoxFuture<'static, Result<Arc<dyn MathEngine>, FormulaError>>>;

/// Observable state of the shared engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Initializing {
        signature: CapabilitySignature,
    },
    Ready {
        signature: CapabilitySignature,
    },
    Reinitializing {
        from: CapabilitySignature,
        to: CapabilitySignature,
    },
    /// The last (re)initialization failed. Terminal unless recovery is enabled.
    Failed {
        signature: CapabilitySignature,
        message: String,
    },
}

impl EngineState {
    /// Signature the engine has, or will have once the pending work settles.
    fn target_signature(&self) -> Option<&CapabilitySignature> {
        match self {
            EngineState::Uninitialized | EngineState::Failed { .. } => None,
            EngineState::Initializing { signature } | EngineState::Ready { signature } => {
                Some(signature)
            }
            EngineState::Reinitializing { to, .. } => Some(to),
        }
    }
}

/// Snapshot reported by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub state: EngineState,
    pub core_capabilities: Vec<String>,
    pub initializations: u64,
}

struct Slot {
    state: EngineState,
    generation: u64,
    pending: Option<EngineReady>,
}

/// Owner of the process-wide engine instance.
pub struct EngineLifecycle {
    factory: Arc<dyn EngineFactory>,
    core: Arc<Vec<String>>,
    recover_after_failure: bool,
    slot: Arc<Mutex<Slot>>,
    initializations: Arc<AtomicU64>,
}

impl EngineLifecycle {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        core: Vec<String>,
        recover_after_failure: bool,
    ) -> Self {
        Self {
            factory,
            core: Arc::new(core),
            recover_after_failure,
            slot: Arc::new(Mutex::new(Slot {
                state: EngineState::Uninitialized,
                generation: 0,
                pending: None,
            })),
            initializations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ready signal for an engine satisfying `required`.
    ///
    /// Must be called while holding the engine lock. An empty requirement is
    /// satisfied by whichever engine is current; any other requirement must
    /// match the loaded signature exactly or the engine is rebuilt.
    pub fn ensure(&self, required: &CapabilitySignature) -> EngineReady {
        let mut slot = mutex_lock(&self.slot, SOURCE, "ensure");

        if let EngineState::Failed { signature, message } = &slot.state {
            if !self.recover_after_failure {
                return failed(message.clone());
            }
            warn!(
                target = SOURCE,
                signature = %signature,
                result = "recovering",
                "engine failed earlier, restarting from uninitialized"
            );
            slot.state = EngineState::Uninitialized;
            slot.pending = None;
        }

        if let (Some(current), Some(pending)) = (slot.state.target_signature(), &slot.pending)
            && (required.is_empty() || current == required)
        {
            return pending.clone();
        }

        self.begin(&mut slot, required.clone())
    }

    fn begin(&self, slot: &mut Slot, target: CapabilitySignature) -> EngineReady {
        slot.generation += 1;
        let generation = slot.generation;
        let previous = slot.pending.take();

        let kind = match slot.state.target_signature() {
            Some(from) => {
                info!(
                    target = SOURCE,
                    op = "reinitialize",
                    from = %from,
                    to = %target,
                    "replacing engine"
                );
                slot.state = EngineState::Reinitializing {
                    from: from.clone(),
                    to: target.clone(),
                };
                "reinitialize"
            }
            None => {
                info!(target = SOURCE, op = "initialize", signature = %target, "starting engine");
                slot.state = EngineState::Initializing {
                    signature: target.clone(),
                };
                "initialize"
            }
        };

        self.initializations.fetch_add(1, Ordering::SeqCst);
        counter!(METRIC_ENGINE_INIT, "kind" => kind).increment(1);

        let factory = Arc::clone(&self.factory);
        let capabilities = target.with_core(&self.core);
        let shared_slot = Arc::clone(&self.slot);

        let task = tokio::spawn(async move {
            let started = Instant::now();
            if let Some(previous) = previous
                && let Ok(engine) = previous.await
            {
                engine.shutdown().await;
            }

            let outcome = async {
                let engine = factory.create(&capabilities).await?;
                engine.ready().await?;
                Ok::<_, super::types::EngineError>(engine)
            }
            .await
            .map_err(|err| FormulaError::engine_initialization(err.to_string()));

            let elapsed_ms = started.elapsed().as_millis() as u64;
            let mut slot = mutex_lock(&shared_slot, SOURCE, "install");
            if slot.generation == generation {
                slot.state = match &outcome {
                    Ok(_) => EngineState::Ready {
                        signature: target.clone(),
                    },
                    Err(err) => EngineState::Failed {
                        signature: target.clone(),
                        message: err.to_string(),
                    },
                };
            }
            drop(slot);

            match &outcome {
                Ok(_) => info!(
                    target = SOURCE,
                    op = kind,
                    signature = %target,
                    result = "ready",
                    elapsed_ms,
                    "engine ready"
                ),
                Err(err) => warn!(
                    target = SOURCE,
                    op = kind,
                    signature = %target,
                    result = "failed",
                    elapsed_ms,
                    error = %err,
                    "engine initialization failed"
                ),
            }
            outcome
        });

        let ready: EngineReady = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(FormulaError::engine_initialization(format!(
                    "initialization task aborted: {join_error}"
                ))),
            }
        }
        .boxed()
        .shared();

        slot.pending = Some(ready.clone());
        ready
    }

    /// Generation of the current engine. Read it under the engine lock,
    /// right after [`EngineLifecycle::ensure`], to name the engine a later
    /// [`EngineLifecycle::invalidate`] refers to.
    pub fn generation(&self) -> u64 {
        mutex_lock(&self.slot, SOURCE, "generation").generation
    }

    /// Retire the engine of `generation` after its process went away.
    ///
    /// Moves to `Uninitialized` when recovery is enabled and to `Failed`
    /// otherwise. A stale generation is ignored, so a report about an
    /// engine that was already replaced cannot retire its successor.
    pub fn invalidate(&self, generation: u64, reason: &str) {
        let pending = {
            let mut slot = mutex_lock(&self.slot, SOURCE, "invalidate");
            if slot.generation != generation {
                return;
            }
            let signature = slot.state.target_signature().cloned().unwrap_or_default();
            warn!(
                target = SOURCE,
                op = "invalidate",
                signature = %signature,
                recover = self.recover_after_failure,
                error = reason,
                "engine lost"
            );
            slot.generation += 1;
            slot.state = if self.recover_after_failure {
                EngineState::Uninitialized
            } else {
                EngineState::Failed {
                    signature,
                    message: format!("engine lost: {reason}"),
                }
            };
            slot.pending.take()
        };

        if let Some(pending) = pending {
            tokio::spawn(async move {
                if let Ok(engine) = pending.await {
                    engine.shutdown().await;
                }
            });
        }
    }

    pub fn state(&self) -> EngineState {
        mutex_lock(&self.slot, SOURCE, "state").state.clone()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state(), EngineState::Failed { .. })
    }

    /// Number of (re)initializations started since the process began.
    pub fn initializations(&self) -> u64 {
        self.initializations.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            core_capabilities: self.core.as_ref().clone(),
            initializations: self.initializations(),
        }
    }

    /// Tear the current engine down and return to `Uninitialized`.
    pub async fn shutdown(&self) {
        let pending = {
            let mut slot = mutex_lock(&self.slot, SOURCE, "shutdown");
            slot.generation += 1;
            slot.state = EngineState::Uninitialized;
            slot.pending.take()
        };
        if let Some(pending) = pending
            && let Ok(engine) = pending.await
        {
            engine.shutdown().await;
        }
    }
}

fn failed(message: String) -> EngineReady {
    future::ready(Err(FormulaError::engine_initialization(message)))
        .boxed()
        .shared()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::application::render::types::{EngineError, Fragment};
    use crate::domain::formula::FormulaInput;
    use crate::domain::options::EngineOptions;

    struct NullEngine {
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MathEngine for NullEngine {
        async fn ready(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn render_svg(
            &self,
            _input: &FormulaInput,
            _options: &EngineOptions,
        ) -> Result<Vec<Fragment>, EngineError> {
            Ok(Vec::new())
        }

        async fn to_mathml(&self, _input: &FormulaInput) -> Result<String, EngineError> {
            Ok("<math/>".to_string())
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: Mutex<Vec<Vec<String>>>,
        shutdowns: Arc<AtomicUsize>,
        fail_on: Option<&'static str>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl EngineFactory for CountingFactory {
        async fn create(
            &self,
            capabilities: &[String],
        ) -> Result<Arc<dyn MathEngine>, EngineError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.created
                .lock()
                .expect("factory lock")
                .push(capabilities.to_vec());
            if let Some(bad) = self.fail_on
                && capabilities.iter().any(|name| name == bad)
            {
                return Err(EngineError::startup(format!("cannot load {bad}")));
            }
            Ok(Arc::new(NullEngine {
                shutdowns: Arc::clone(&self.shutdowns),
            }))
        }
    }

    fn sig(names: &[&str]) -> CapabilitySignature {
        CapabilitySignature::new(names.iter().copied())
    }

    fn lifecycle(factory: Arc<CountingFactory>, recover: bool) -> EngineLifecycle {
        EngineLifecycle::new(factory, vec!["base".to_string()], recover)
    }

    #[tokio::test]
    async fn alternating_signatures_rebuild_every_time() {
        let factory = Arc::new(CountingFactory::default());
        let lifecycle = lifecycle(Arc::clone(&factory), false);

        for names in [&["mhchem"][..], &["cancel"], &["mhchem"]] {
            lifecycle.ensure(&sig(names)).await.expect("engine ready");
        }

        assert_eq!(lifecycle.initializations(), 3);
        let created = factory.created.lock().expect("factory lock").clone();
        assert_eq!(
            created,
            vec![
                vec!["base".to_string(), "mhchem".to_string()],
                vec!["base".to_string(), "cancel".to_string()],
                vec!["base".to_string(), "mhchem".to_string()],
            ]
        );
        assert_eq!(factory.shutdowns.load(Ordering::SeqCst), 2);
        assert_eq!(
            lifecycle.state(),
            EngineState::Ready {
                signature: sig(&["mhchem"])
            }
        );
    }

    #[tokio::test]
    async fn matching_or_empty_requirement_reuses_engine() {
        let factory = Arc::new(CountingFactory::default());
        let lifecycle = lifecycle(Arc::clone(&factory), false);

        lifecycle.ensure(&sig(&["color"])).await.expect("ready");
        lifecycle.ensure(&sig(&["color"])).await.expect("ready");
        lifecycle.ensure(&CapabilitySignature::default()).await.expect("ready");

        assert_eq!(lifecycle.initializations(), 1);
    }

    #[tokio::test]
    async fn first_request_without_requirement_starts_default_engine() {
        let factory = Arc::new(CountingFactory::default());
        let lifecycle = lifecycle(Arc::clone(&factory), false);
        assert_eq!(lifecycle.state(), EngineState::Uninitialized);

        lifecycle.ensure(&CapabilitySignature::default()).await.expect("ready");
        assert_eq!(
            lifecycle.state(),
            EngineState::Ready {
                signature: CapabilitySignature::default()
            }
        );
        let created = factory.created.lock().expect("factory lock").clone();
        assert_eq!(created, vec![vec!["base".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_one_initialization() {
        let factory = Arc::new(CountingFactory {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let lifecycle = lifecycle(Arc::clone(&factory), false);

        let first = lifecycle.ensure(&sig(&["cancel"]));
        let second = lifecycle.ensure(&sig(&["cancel"]));
        assert_eq!(
            lifecycle.state(),
            EngineState::Initializing {
                signature: sig(&["cancel"])
            }
        );
        let (a, b) = tokio::join!(first, second);
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(lifecycle.initializations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reinitialization_is_observable_while_pending() {
        let factory = Arc::new(CountingFactory {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let lifecycle = lifecycle(Arc::clone(&factory), false);
        lifecycle.ensure(&sig(&["color"])).await.expect("ready");

        let pending = lifecycle.ensure(&sig(&["mhchem"]));
        assert_eq!(
            lifecycle.state(),
            EngineState::Reinitializing {
                from: sig(&["color"]),
                to: sig(&["mhchem"])
            }
        );
        pending.await.expect("ready");
        assert_eq!(
            lifecycle.state(),
            EngineState::Ready {
                signature: sig(&["mhchem"])
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_initialization_still_installs() {
        let factory = Arc::new(CountingFactory {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let lifecycle = lifecycle(Arc::clone(&factory), false);

        drop(lifecycle.ensure(&sig(&["bbox"])));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(
            lifecycle.state(),
            EngineState::Ready {
                signature: sig(&["bbox"])
            }
        );
    }

    #[tokio::test]
    async fn failure_is_terminal_by_default() {
        let factory = Arc::new(CountingFactory {
            fail_on: Some("broken"),
            ..Default::default()
        });
        let lifecycle = lifecycle(Arc::clone(&factory), false);

        let err = lifecycle
            .ensure(&sig(&["broken"]))
            .await
            .err()
            .expect("initialization fails");
        assert!(matches!(err, FormulaError::EngineInitialization { .. }));
        assert!(lifecycle.is_failed());

        let again = lifecycle.ensure(&CapabilitySignature::default()).await;
        assert!(matches!(again, Err(FormulaError::EngineInitialization { .. })));
        assert_eq!(lifecycle.initializations(), 1);
    }

    #[tokio::test]
    async fn failure_recovers_when_enabled() {
        let factory = Arc::new(CountingFactory {
            fail_on: Some("broken"),
            ..Default::default()
        });
        let lifecycle = lifecycle(Arc::clone(&factory), true);

        assert!(lifecycle.ensure(&sig(&["broken"])).await.is_err());
        lifecycle
            .ensure(&CapabilitySignature::default())
            .await
            .expect("recovered engine");
        assert_eq!(lifecycle.initializations(), 2);
        assert!(!lifecycle.is_failed());
    }

    #[tokio::test]
    async fn lost_engine_is_rebuilt_when_recovery_is_enabled() {
        let factory = Arc::new(CountingFactory::default());
        let lifecycle = lifecycle(Arc::clone(&factory), true);
        lifecycle.ensure(&sig(&["cancel"])).await.expect("ready");

        lifecycle.invalidate(lifecycle.generation(), "worker closed its output");
        assert_eq!(lifecycle.state(), EngineState::Uninitialized);

        lifecycle.ensure(&sig(&["cancel"])).await.expect("rebuilt");
        assert_eq!(lifecycle.initializations(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(factory.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lost_engine_fails_without_recovery() {
        let factory = Arc::new(CountingFactory::default());
        let lifecycle = lifecycle(Arc::clone(&factory), false);
        lifecycle.ensure(&sig(&["cancel"])).await.expect("ready");

        lifecycle.invalidate(lifecycle.generation(), "broken pipe");
        match lifecycle.state() {
            EngineState::Failed { signature, message } => {
                assert_eq!(signature, sig(&["cancel"]));
                assert!(message.contains("broken pipe"));
            }
            other => panic!("expected failed state, got {other:?}"),
        }

        let again = lifecycle.ensure(&CapabilitySignature::default()).await;
        assert!(matches!(again, Err(FormulaError::EngineInitialization { .. })));
        assert_eq!(lifecycle.initializations(), 1);
    }

    #[tokio::test]
    async fn stale_invalidation_leaves_successor_alone() {
        let factory = Arc::new(CountingFactory::default());
        let lifecycle = lifecycle(Arc::clone(&factory), false);
        lifecycle.ensure(&sig(&["color"])).await.expect("ready");
        let stale = lifecycle.generation();

        lifecycle.ensure(&sig(&["mhchem"])).await.expect("ready");
        lifecycle.invalidate(stale, "old worker exited");

        assert_eq!(
            lifecycle.state(),
            EngineState::Ready {
                signature: sig(&["mhchem"])
            }
        );
    }

    #[tokio::test]
    async fn shutdown_releases_engine() {
        let factory = Arc::new(CountingFactory::default());
        let lifecycle = lifecycle(Arc::clone(&factory), false);
        lifecycle.ensure(&sig(&["verb"])).await.expect("ready");
        lifecycle.shutdown().await;
        assert_eq!(factory.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), EngineState::Uninitialized);
    }
}
