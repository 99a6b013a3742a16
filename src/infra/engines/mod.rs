//! Adapters for the external collaborators: rendering engines, speech
//! engines and the raster converter.

mod katex;
mod raster;
mod speech;
mod worker;

use std::sync::Arc;

use tracing::{info, warn};

use crate::application::render::{EngineFactory, SpeechEngine};
use crate::config::{EngineBackend, EngineSettings, ProcessCommand, SpeechSettings};

use super::error::InfraError;

pub use katex::{KatexEngine, KatexEngineFactory};
pub use raster::ResvgRasterizer;
pub use speech::{MathCatSpeech, SreSpeech};
pub use worker::{WorkerCommand, WorkerEngine, WorkerEngineFactory, WorkerProcess};

impl From<&ProcessCommand> for WorkerCommand {
    fn from(command: &ProcessCommand) -> Self {
        WorkerCommand::new(command.program.clone(), command.args.clone())
    }
}

/// Factory for the configured rendering backend.
pub fn engine_factory(settings: &EngineSettings) -> Result<Arc<dyn EngineFactory>, InfraError> {
    let factory: Arc<dyn EngineFactory> = match settings.backend {
        EngineBackend::Katex => Arc::new(KatexEngineFactory),
        EngineBackend::Worker => {
            let command = settings.worker.as_ref().ok_or_else(|| {
                InfraError::configuration("engine.worker_command is required for the worker backend")
            })?;
            Arc::new(WorkerEngineFactory::new(command.into()))
        }
    };
    info!(
        target = "mathgate::infra::engines",
        backend = ?settings.backend,
        core = ?settings.core_capabilities,
        "rendering backend selected"
    );
    if !settings.backend.supports_raster() {
        warn!(
            target = "mathgate::infra::engines",
            backend = ?settings.backend,
            "PNG output will be blank: resvg does not draw the HTML this backend emits; \
             use the worker backend for raster output"
        );
    }
    Ok(factory)
}

/// Speech engines that have a configured command.
pub fn speech_engines(settings: &SpeechSettings) -> Vec<Arc<dyn SpeechEngine>> {
    let mut engines: Vec<Arc<dyn SpeechEngine>> = Vec::new();
    if let Some(command) = settings.sre.as_ref() {
        engines.push(Arc::new(SreSpeech::new(command.into())));
    }
    if let Some(command) = settings.mathcat.as_ref() {
        engines.push(Arc::new(MathCatSpeech::new(command.into())));
    }
    engines
}
