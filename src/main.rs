use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use mathgate::{
    application::{
        error::AppError,
        render::{EngineLifecycle, FormulaService, OrchestratorConfig},
    },
    cache::{ArtifactCache, CacheConfig, CacheState, ResponseCache},
    config,
    domain::options::{FormulaRequest, InputLimits},
    infra::{
        engines,
        error::InfraError,
        http::{self, ErrorPolicy, HttpState},
        telemetry,
    },
};
use tokio::{io::AsyncWriteExt, sync::Notify, task::JoinHandle};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
    }
}

struct ApplicationContext {
    service: Arc<FormulaService>,
    artifacts: Arc<ArtifactCache>,
    responses: Arc<ResponseCache>,
    limits: InputLimits,
    cache_config: CacheConfig,
}

fn build_application_context(settings: &config::Settings) -> Result<ApplicationContext, AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let artifacts = Arc::new(ArtifactCache::new(&cache_config));
    let responses = Arc::new(ResponseCache::new(&cache_config));

    let factory = engines::engine_factory(&settings.engine)?;
    let lifecycle = Arc::new(EngineLifecycle::new(
        factory,
        settings.engine.core_capabilities.clone(),
        settings.engine.recover_after_failure,
    ));

    let orchestrator = OrchestratorConfig {
        engine_timeout: settings.engine.timeout,
        raster_timeout: settings.raster.timeout,
        speech_timeout: settings.speech.timeout,
        max_raster_dimension: settings.raster.max_dimension,
    };
    let mut service = FormulaService::new(
        lifecycle,
        Arc::clone(&artifacts),
        Arc::new(engines::ResvgRasterizer::default()),
        orchestrator,
    );
    for speech in engines::speech_engines(&settings.speech) {
        service = service.with_speech_engine(speech);
    }

    Ok(ApplicationContext {
        service: Arc::new(service),
        artifacts,
        responses,
        limits: InputLimits {
            max_formula_chars: settings.limits.max_formula_chars,
            max_raster_width: settings.raster.max_dimension,
            default_dpi: settings.raster.dpi,
        },
        cache_config,
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;

    if let Err(err) = app.service.warmup().await {
        warn!(
            target = "mathgate::bootstrap",
            error = %err,
            outlook = settings.engine.failure_outlook(),
            "engine warmup failed"
        );
    }

    let purge = spawn_purge_task(Arc::clone(&app.artifacts), Arc::clone(&app.responses));

    let state = HttpState {
        service: Arc::clone(&app.service),
        cache: CacheState {
            responses: Arc::clone(&app.responses),
        },
        limits: app.limits,
        errors: ErrorPolicy::from(&settings.errors),
        success_max_age: app.cache_config.response_ttl_seconds,
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "mathgate::bootstrap",
        addr = %settings.server.addr,
        "listening"
    );

    let stopping = Arc::new(Notify::new());
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown({
            let stopping = Arc::clone(&stopping);
            async move {
                shutdown_signal().await;
                stopping.notify_one();
            }
        })
        .into_future();
    let grace = settings.server.graceful_shutdown;

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = async {
            stopping.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(
                target = "mathgate::bootstrap",
                grace_seconds = grace.as_secs(),
                "in-flight requests did not finish before the shutdown deadline"
            );
        }
    }

    purge.abort();
    app.service.lifecycle().shutdown().await;
    info!(target = "mathgate::bootstrap", "stopped");
    Ok(())
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let app = build_application_context(&settings)?;

    let pairs = args.query_pairs().map_err(AppError::unexpected)?;
    let request = FormulaRequest::from_query(&pairs, &app.limits)?;
    let rendered = app.service.render(&request).await;
    app.service.lifecycle().shutdown().await;
    let artifact = rendered?;

    match args.output.as_ref() {
        Some(path) => tokio::fs::write(path, &artifact.body)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(&artifact.body)
                .await
                .map_err(|err| AppError::from(InfraError::from(err)))?;
            stdout
                .flush()
                .await
                .map_err(|err| AppError::from(InfraError::from(err)))?;
        }
    }
    Ok(())
}

/// Periodically drop expired cache entries so idle keys do not pin memory.
fn spawn_purge_task(artifacts: Arc<ArtifactCache>, responses: Arc<ResponseCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let artifacts_dropped = artifacts.purge_expired();
            let responses_dropped = responses.purge_expired();
            if artifacts_dropped + responses_dropped > 0 {
                info!(
                    target = "mathgate::cache::purge",
                    artifacts = artifacts_dropped,
                    responses = responses_dropped,
                    "expired cache entries purged"
                );
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "mathgate::bootstrap", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = "mathgate::bootstrap", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target = "mathgate::bootstrap", "shutdown signal received");
}
