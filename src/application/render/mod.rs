//! Formula rendering core.
//!
//! The engines themselves are external collaborators behind the traits in
//! [`types`]. This module owns how they are shared: named FIFO locks,
//! deadlines that detach instead of cancel, the engine lifecycle, fragment
//! composition and the per-request orchestration.

pub mod compose;
pub mod fallback;
pub mod lifecycle;
pub mod orchestrator;
pub mod runtime;
pub mod svg;
pub mod types;

pub use compose::{FRAGMENT_MARGIN_EX, compose, select_chunk};
pub use lifecycle::{EngineLifecycle, EngineReady, EngineState, EngineStatus};
pub use orchestrator::{
    FormulaService, OrchestratorConfig, RenderedArtifact, ServiceStatus,
};
pub use runtime::{DeadlineError, LockGuard, NamedLock, ResourceLocks, guarded, with_deadline};
pub use svg::finalize;
pub use types::{
    EngineError, EngineFactory, Fragment, FragmentMetrics, MathEngine, RasterConverter,
    RasterTarget, SpeechEngine, ViewBox,
};
