#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    http::{HeaderMap, Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use mathgate::application::render::{
    EngineError, EngineFactory, EngineLifecycle, Fragment, FormulaService, MathEngine,
    OrchestratorConfig, SpeechEngine,
};
use mathgate::cache::{ArtifactCache, CacheConfig, CacheState, ResponseCache};
use mathgate::config::ErrorMode;
use mathgate::domain::formula::FormulaInput;
use mathgate::domain::options::{EngineOptions, InputLimits, SpeechEngineKind, SpeechOptions};
use mathgate::infra::engines::ResvgRasterizer;
use mathgate::infra::http::{ErrorPolicy, HttpState, build_router};

pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Engine double emitting one fragment per `\\`-separated line.
///
/// Fragments carry the assistive attributes a real engine adds so tests can
/// check they are stripped. `\fail` makes the render fail and `\crash`
/// reports the engine process as gone.
pub struct FakeEngine {
    capabilities: Vec<String>,
    delay: Duration,
    renders: Arc<AtomicUsize>,
}

impl FakeEngine {
    fn fragment(line: &str) -> Result<Fragment, EngineError> {
        let chars = line.trim().chars().count().max(1);
        let width_ex = chars as f64 * 1.2;
        let units = chars * 600;
        Fragment::from_svg(format!(
            concat!(
                r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}ex" height="2.2ex" "#,
                r#"role="img" focusable="false" aria-label="{label}" "#,
                r#"style="vertical-align: -0.6ex" viewBox="0 -800 {units} 1100">"#,
                r#"<g data-mml-node="math" aria-hidden="true"><path d="M0 0H{units}V-500H0Z"/></g>"#,
                "</svg>"
            ),
            w = width_ex,
            units = units,
            label = chars,
        ))
    }
}

#[async_trait]
impl MathEngine for FakeEngine {
    async fn ready(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn render_svg(
        &self,
        input: &FormulaInput,
        _options: &EngineOptions,
    ) -> Result<Vec<Fragment>, EngineError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.renders.fetch_add(1, Ordering::SeqCst);
        if input.text().contains("\\fail") {
            return Err(EngineError::render("Undefined control sequence \\fail"));
        }
        if input.text().contains("\\crash") {
            return Err(EngineError::disconnected("fake worker closed its output"));
        }
        input.text().split("\\\\").map(Self::fragment).collect()
    }

    async fn to_mathml(&self, input: &FormulaInput) -> Result<String, EngineError> {
        Ok(format!(
            "<math><mi>{}</mi><!-- {} --></math>",
            input.text(),
            self.capabilities.join(",")
        ))
    }

    async fn shutdown(&self) {}
}

/// Factory double recording every capability list it was asked to load.
pub struct FakeFactory {
    created: AtomicUsize,
    loaded: Mutex<Vec<Vec<String>>>,
    renders: Arc<AtomicUsize>,
    fail_startup: bool,
    render_delay: Duration,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false, Duration::ZERO))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::build(true, Duration::ZERO))
    }

    pub fn slow(render_delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(false, render_delay))
    }

    fn build(fail_startup: bool, render_delay: Duration) -> Self {
        Self {
            created: AtomicUsize::new(0),
            loaded: Mutex::new(Vec::new()),
            renders: Arc::new(AtomicUsize::new(0)),
            fail_startup,
            render_delay,
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> Vec<Vec<String>> {
        self.loaded.lock().expect("loaded lock").clone()
    }
}

#[async_trait]
impl EngineFactory for FakeFactory {
    async fn create(&self, capabilities: &[String]) -> Result<Arc<dyn MathEngine>, EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.loaded
            .lock()
            .expect("loaded lock")
            .push(capabilities.to_vec());
        if self.fail_startup {
            return Err(EngineError::startup("fake engine refused to start"));
        }
        Ok(Arc::new(FakeEngine {
            capabilities: capabilities.to_vec(),
            delay: self.render_delay,
            renders: Arc::clone(&self.renders),
        }))
    }
}

pub struct FakeSpeech {
    kind: SpeechEngineKind,
}

impl FakeSpeech {
    pub fn new(kind: SpeechEngineKind) -> Arc<Self> {
        Arc::new(Self { kind })
    }
}

#[async_trait]
impl SpeechEngine for FakeSpeech {
    fn kind(&self) -> SpeechEngineKind {
        self.kind
    }

    async fn speak(&self, mathml: &str, options: &SpeechOptions) -> Result<String, EngineError> {
        Ok(format!(
            "{} {} reads {} characters",
            self.kind.as_str(),
            options.style,
            mathml.chars().count()
        ))
    }
}

pub const CORE: [&str; 2] = ["base", "ams"];

/// Router plus handles on everything a test wants to inspect.
pub struct Harness {
    pub router: Router,
    pub service: Arc<FormulaService>,
    pub responses: Arc<ResponseCache>,
    pub factory: Arc<FakeFactory>,
}

pub fn harness(factory: Arc<FakeFactory>, mode: ErrorMode) -> Harness {
    harness_with(factory, mode, OrchestratorConfig::default())
}

pub fn harness_with(
    factory: Arc<FakeFactory>,
    mode: ErrorMode,
    orchestrator: OrchestratorConfig,
) -> Harness {
    build_harness(factory, mode, orchestrator, false)
}

/// Harness whose engine lifecycle restarts after failures.
pub fn harness_recovering(factory: Arc<FakeFactory>, mode: ErrorMode) -> Harness {
    build_harness(factory, mode, OrchestratorConfig::default(), true)
}

fn build_harness(
    factory: Arc<FakeFactory>,
    mode: ErrorMode,
    orchestrator: OrchestratorConfig,
    recover_after_failure: bool,
) -> Harness {
    let cache_config = CacheConfig::default();
    let artifacts = Arc::new(ArtifactCache::new(&cache_config));
    let responses = Arc::new(ResponseCache::new(&cache_config));
    let lifecycle = Arc::new(EngineLifecycle::new(
        Arc::clone(&factory) as Arc<dyn EngineFactory>,
        CORE.iter().map(|name| name.to_string()).collect(),
        recover_after_failure,
    ));
    let service = Arc::new(
        FormulaService::new(
            lifecycle,
            artifacts,
            Arc::new(ResvgRasterizer::without_fonts()),
            orchestrator,
        )
        .with_speech_engine(FakeSpeech::new(SpeechEngineKind::Sre)),
    );

    let state = HttpState {
        service: Arc::clone(&service),
        cache: CacheState {
            responses: Arc::clone(&responses),
        },
        limits: InputLimits::default(),
        errors: ErrorPolicy {
            mode,
            max_message_chars: 200,
        },
        success_max_age: cache_config.response_ttl_seconds,
    };

    Harness {
        router: build_router(state),
        service,
        responses,
        factory,
    }
}

pub async fn send(router: &Router, method: Method, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    (status, headers, body)
}

pub async fn get(router: &Router, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
    send(router, Method::GET, uri).await
}

pub fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}
