//! Per-request control flow.
//!
//! validate (caller) → artifact cache → engine lock → engine ready → engine
//! call → release → compose → converter lock → convert → release. Locks are
//! only ever taken engine-then-converter, and every stage after validation
//! runs under a deadline. Any failure is returned to the caller, which turns
//! it into a fallback via [`FormulaService::fallback`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::{ArtifactCache, ArtifactCacheEntry, CacheKey, StoreStats};
use crate::domain::capability::CapabilitySignature;
use crate::domain::error::{FormulaError, ProcessingStage};
use crate::domain::formula::InputType;
use crate::domain::options::{FormulaRequest, OutputFormat, SpeechEngineKind};

use super::compose::{compose, select_chunk};
use super::fallback::{PLACEHOLDER_PNG, placeholder_svg, speech_text, truncate_message};
use super::lifecycle::{EngineLifecycle, EngineStatus};
use super::runtime::{ResourceLocks, guarded};
use super::svg::finalize;
use super::types::{EngineError, RasterConverter, RasterTarget, SpeechEngine};

const SOURCE: &str = "application::render::orchestrator";
const METRIC_RENDER_MS: &str = "mathgate_render_ms";
const METRIC_STAGE_MS: &str = "mathgate_stage_ms";
const METRIC_FALLBACK: &str = "mathgate_fallback_total";

/// Deadlines and bounds of the orchestrated stages.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub engine_timeout: Duration,
    pub raster_timeout: Duration,
    pub speech_timeout: Duration,
    pub max_raster_dimension: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            engine_timeout: Duration::from_millis(3000),
            raster_timeout: Duration::from_millis(3000),
            speech_timeout: Duration::from_millis(3000),
            max_raster_dimension: 4096,
        }
    }
}

/// Finished output of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedArtifact {
    pub format: OutputFormat,
    pub body: Bytes,
}

impl RenderedArtifact {
    fn new(format: OutputFormat, body: impl Into<Bytes>) -> Self {
        Self {
            format,
            body: body.into(),
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

/// Service status for introspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub engine: EngineStatus,
    pub artifacts: StoreStats,
    pub speech_engines: Vec<&'static str>,
}

pub struct FormulaService {
    lifecycle: Arc<EngineLifecycle>,
    locks: ResourceLocks,
    artifacts: Arc<ArtifactCache>,
    raster: Arc<dyn RasterConverter>,
    sre: Option<Arc<dyn SpeechEngine>>,
    mathcat: Option<Arc<dyn SpeechEngine>>,
    config: OrchestratorConfig,
}

impl FormulaService {
    pub fn new(
        lifecycle: Arc<EngineLifecycle>,
        artifacts: Arc<ArtifactCache>,
        raster: Arc<dyn RasterConverter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            lifecycle,
            locks: ResourceLocks::default(),
            artifacts,
            raster,
            sre: None,
            mathcat: None,
            config,
        }
    }

    /// Register a speech engine under its own kind, replacing any previous one.
    pub fn with_speech_engine(mut self, engine: Arc<dyn SpeechEngine>) -> Self {
        match engine.kind() {
            SpeechEngineKind::Sre => self.sre = Some(engine),
            SpeechEngineKind::MathCat => self.mathcat = Some(engine),
        }
        self
    }

    pub fn lifecycle(&self) -> &EngineLifecycle {
        &self.lifecycle
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn status(&self) -> ServiceStatus {
        let speech_engines = [
            (SpeechEngineKind::Sre, &self.sre),
            (SpeechEngineKind::MathCat, &self.mathcat),
        ]
        .into_iter()
        .filter(|(_, engine)| engine.is_some())
        .map(|(kind, _)| kind.as_str())
        .collect();

        ServiceStatus {
            engine: self.lifecycle.status(),
            artifacts: self.artifacts.fragment_stats(),
            speech_engines,
        }
    }

    /// Start the default engine ahead of the first request.
    pub async fn warmup(&self) -> Result<(), FormulaError> {
        let _guard = self.locks.engine.acquire().await;
        let ready = self.lifecycle.ensure(&CapabilitySignature::default());
        guarded(ProcessingStage::EngineReady, self.config.engine_timeout, ready)
            .await
            .map(|_| ())
    }

    /// Produce the artifact for a validated request.
    pub async fn render(&self, request: &FormulaRequest) -> Result<RenderedArtifact, FormulaError> {
        let started = Instant::now();
        let result = match request.format {
            OutputFormat::Svg => self
                .render_svg(request)
                .await
                .map(|svg| RenderedArtifact::new(OutputFormat::Svg, svg)),
            OutputFormat::Png => self
                .render_png(request)
                .await
                .map(|png| RenderedArtifact::new(OutputFormat::Png, png)),
            OutputFormat::Speech => self
                .render_speech(request)
                .await
                .map(|text| RenderedArtifact::new(OutputFormat::Speech, text)),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        histogram!(METRIC_RENDER_MS, "format" => request.format.as_str(), "result" => outcome)
            .record(elapsed_ms);

        match &result {
            Ok(artifact) => info!(
                target = SOURCE,
                op = "render",
                format = request.format.as_str(),
                input = request.input.input_type().as_str(),
                result = "ok",
                bytes = artifact.body.len(),
                elapsed_ms = elapsed_ms as u64,
                "formula rendered"
            ),
            Err(err) => warn!(
                target = SOURCE,
                op = "render",
                format = request.format.as_str(),
                input = request.input.input_type().as_str(),
                result = "error",
                kind = err.kind(),
                error = %err,
                elapsed_ms = elapsed_ms as u64,
                "formula rendering failed"
            ),
        }
        result
    }

    /// Fragments for `request`, from the artifact cache or the engine.
    async fn fragments(
        &self,
        request: &FormulaRequest,
    ) -> Result<Arc<ArtifactCacheEntry>, FormulaError> {
        let key = CacheKey::fragments(request);
        if let Some(entry) = self.artifacts.get_fragments(&key) {
            return Ok(entry);
        }

        let requirement = CapabilitySignature::from_input(&request.input);
        let guard = self.locks.engine.acquire().await;

        let ready = self.lifecycle.ensure(&requirement);
        let generation = self.lifecycle.generation();
        let engine = guarded(ProcessingStage::EngineReady, self.config.engine_timeout, ready).await?;

        let input = request.input.clone();
        let options = request.engine.clone();
        let started = Instant::now();
        let outcome = guarded(ProcessingStage::Engine, self.config.engine_timeout, async move {
            Ok(engine.render_svg(&input, &options).await)
        })
        .await;
        let fragments = self.engine_outcome(generation, outcome);
        drop(guard);
        record_stage("engine", started);

        let fragments = fragments?;
        if fragments.is_empty() {
            return Err(FormulaError::conversion("engine produced no output"));
        }
        let entry = Arc::new(ArtifactCacheEntry::new(fragments));
        self.artifacts.set_fragments(key, Arc::clone(&entry));
        Ok(entry)
    }

    async fn render_svg(&self, request: &FormulaRequest) -> Result<String, FormulaError> {
        let entry = self.fragments(request).await?;
        let svg = match request.presentation.chunk {
            Some(index) => select_chunk(&entry.fragments, index)?.svg.clone(),
            None => compose(&entry.fragments)?,
        };
        finalize(
            &svg,
            request.presentation.scale,
            request.presentation.color.as_deref(),
        )
    }

    async fn render_png(&self, request: &FormulaRequest) -> Result<Vec<u8>, FormulaError> {
        let svg = self.render_svg(request).await?;
        let target = RasterTarget {
            width: request.raster.width,
            dpi: request.raster.dpi,
            ex_px: request.engine.ex,
            max_dimension: self.config.max_raster_dimension,
        };
        self.rasterize(svg, target).await
    }

    async fn rasterize(&self, svg: String, target: RasterTarget) -> Result<Vec<u8>, FormulaError> {
        let guard = self.locks.raster.acquire().await;
        let converter = Arc::clone(&self.raster);
        let started = Instant::now();
        let png = guarded(ProcessingStage::Raster, self.config.raster_timeout, async move {
            tokio::task::spawn_blocking(move || converter.rasterize(&svg, &target))
                .await
                .map_err(|err| FormulaError::unexpected(format!("raster task failed: {err}")))?
                .map_err(|err| FormulaError::conversion(err.to_string()))
        })
        .await;
        drop(guard);
        record_stage("raster", started);
        png
    }

    async fn render_speech(&self, request: &FormulaRequest) -> Result<String, FormulaError> {
        let kind = request.speech.engine;
        let speaker = match kind {
            SpeechEngineKind::Sre => self.sre.clone(),
            SpeechEngineKind::MathCat => self.mathcat.clone(),
        }
        .ok_or_else(|| {
            FormulaError::option(format!(
                "speech engine `{}` is not configured",
                kind.as_str()
            ))
        })?;

        let mathml = self.mathml(request).await?;

        let guard = self.locks.speech(kind).acquire().await;
        let options = request.speech.clone();
        let started = Instant::now();
        let text = guarded(ProcessingStage::Speech, self.config.speech_timeout, async move {
            speaker
                .speak(&mathml, &options)
                .await
                .map_err(FormulaError::from)
        })
        .await;
        drop(guard);
        record_stage("speech", started);
        text
    }

    /// MathML for `request`. MathML input is used as-is.
    async fn mathml(&self, request: &FormulaRequest) -> Result<Arc<str>, FormulaError> {
        if request.input.input_type() == InputType::MathMl {
            return Ok(Arc::from(request.input.text()));
        }

        let key = CacheKey::mathml(&request.input);
        if let Some(mathml) = self.artifacts.get_mathml(&key) {
            return Ok(mathml);
        }

        let requirement = CapabilitySignature::from_input(&request.input);
        let guard = self.locks.engine.acquire().await;

        let ready = self.lifecycle.ensure(&requirement);
        let generation = self.lifecycle.generation();
        let engine = guarded(ProcessingStage::EngineReady, self.config.engine_timeout, ready).await?;

        let input = request.input.clone();
        let started = Instant::now();
        let outcome = guarded(ProcessingStage::Engine, self.config.engine_timeout, async move {
            Ok(engine.to_mathml(&input).await)
        })
        .await;
        let mathml = self.engine_outcome(generation, outcome);
        drop(guard);
        record_stage("mathml", started);

        let mathml: Arc<str> = Arc::from(mathml?);
        self.artifacts.set_mathml(key, Arc::clone(&mathml));
        Ok(mathml)
    }

    /// Flatten an engine call. Must run under the engine lock; an engine
    /// whose process is gone is retired so the next request rebuilds it.
    fn engine_outcome<T>(
        &self,
        generation: u64,
        outcome: Result<Result<T, EngineError>, FormulaError>,
    ) -> Result<T, FormulaError> {
        match outcome? {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_disconnected() {
                    self.lifecycle.invalidate(generation, &err.to_string());
                }
                Err(err.into())
            }
        }
    }

    /// Same-content-type artifact describing `error`.
    pub async fn fallback(
        &self,
        format: OutputFormat,
        error: &FormulaError,
        max_message_chars: usize,
    ) -> RenderedArtifact {
        counter!(METRIC_FALLBACK, "kind" => error.kind(), "format" => format.as_str())
            .increment(1);
        let message = truncate_message(&error.to_string(), max_message_chars);

        match format {
            OutputFormat::Svg => RenderedArtifact::new(format, placeholder_svg(&message)),
            OutputFormat::Speech => RenderedArtifact::new(format, speech_text(&message)),
            OutputFormat::Png => {
                let target = RasterTarget {
                    width: None,
                    dpi: crate::domain::options::DEFAULT_DPI,
                    ex_px: crate::domain::options::DEFAULT_EX_PX,
                    max_dimension: self.config.max_raster_dimension,
                };
                match self.rasterize(placeholder_svg(&message), target).await {
                    Ok(png) => RenderedArtifact::new(format, png),
                    Err(err) => {
                        warn!(
                            target = SOURCE,
                            op = "fallback",
                            result = "placeholder_png",
                            error = %err,
                            "fallback rasterization failed"
                        );
                        RenderedArtifact::new(format, Bytes::from_static(PLACEHOLDER_PNG))
                    }
                }
            }
        }
    }
}

fn record_stage(stage: &'static str, started: Instant) {
    histogram!(METRIC_STAGE_MS, "stage" => stage).record(started.elapsed().as_secs_f64() * 1000.0);
}
