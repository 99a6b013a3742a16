//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{
    CliArgs, Command, InputDialect, RenderArgs, RenderFormat, RenderOverrides, ServeArgs,
    ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mathgate";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_TIMEOUT_MS: u64 = 3000;
const DEFAULT_CORE_CAPABILITIES: [&str; 4] = ["base", "ams", "newcommand", "noundefined"];
const DEFAULT_DPI: u32 = 96;
const MIN_DPI: u32 = 16;
const MAX_DPI: u32 = 600;
const DEFAULT_MAX_DIMENSION: u32 = 4096;
const DEFAULT_ARTIFACT_LIMIT: usize = 512;
const DEFAULT_RESPONSE_LIMIT: usize = 1000;
const DEFAULT_RESPONSE_MAX_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_MAX_MESSAGE_CHARS: usize = 200;
const MIN_MESSAGE_CHARS: usize = 8;
const DEFAULT_MAX_FORMULA_CHARS: usize = 20_000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
    pub speech: SpeechSettings,
    pub raster: RasterSettings,
    pub cache: CacheSettings,
    pub errors: ErrorSettings,
    pub limits: LimitSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBackend {
    /// In-process KaTeX.
    Katex,
    /// External process speaking the worker protocol.
    Worker,
}

impl FromStr for EngineBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "katex" => Ok(Self::Katex),
            "worker" => Ok(Self::Worker),
            other => Err(format!("unknown backend `{other}` (expected katex or worker)")),
        }
    }
}

impl EngineBackend {
    /// Whether the raster converter can paint this backend's fragments.
    /// KaTeX emits HTML inside `<foreignObject>`, which resvg does not draw.
    pub fn supports_raster(self) -> bool {
        matches!(self, Self::Worker)
    }
}

/// Executable plus fixed arguments for an external worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backend: EngineBackend,
    pub worker: Option<ProcessCommand>,
    pub core_capabilities: Vec<String>,
    pub timeout: Duration,
    pub recover_after_failure: bool,
}

impl EngineSettings {
    /// What a failed engine startup means for later requests.
    pub fn failure_outlook(&self) -> &'static str {
        if self.recover_after_failure {
            "requests will retry initialization"
        } else {
            "engine stays failed until restart; set engine.recover_after_failure to retry"
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpeechSettings {
    pub sre: Option<ProcessCommand>,
    pub mathcat: Option<ProcessCommand>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RasterSettings {
    pub timeout: Duration,
    pub dpi: u32,
    pub max_dimension: u32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enable_artifact_cache: bool,
    pub artifact_limit: usize,
    pub artifact_ttl_seconds: u64,
    pub enable_response_cache: bool,
    pub response_limit: usize,
    pub response_max_bytes: usize,
    pub response_ttl_seconds: u64,
}

/// How a failed render is reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Success status with a same-content-type artifact carrying the message.
    Inline,
    /// Structured JSON error body with a failure status.
    Status,
}

impl FromStr for ErrorMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "status" => Ok(Self::Status),
            other => Err(format!("unknown mode `{other}` (expected inline or status)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorSettings {
    pub mode: ErrorMode,
    pub max_message_chars: usize,
}

#[derive(Debug, Clone)]
pub struct LimitSettings {
    pub max_formula_chars: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("MATHGATE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("engine.core_capabilities")
            .with_list_parse_key("engine.worker_args")
            .with_list_parse_key("speech.sre_args")
            .with_list_parse_key("speech.mathcat_args")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => raw.apply_render_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    engine: RawEngineSettings,
    speech: RawSpeechSettings,
    raster: RawRasterSettings,
    cache: RawCacheSettings,
    errors: RawErrorSettings,
    limits: RawLimitSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(backend) = overrides.engine_backend.as_ref() {
            self.engine.backend = Some(backend.clone());
        }
        if let Some(mode) = overrides.errors_mode.as_ref() {
            self.errors.mode = Some(mode.clone());
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(backend) = overrides.engine_backend.as_ref() {
            self.engine.backend = Some(backend.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            engine,
            speech,
            raster,
            cache,
            errors,
            limits,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            engine: build_engine_settings(engine)?,
            speech: build_speech_settings(speech)?,
            raster: build_raster_settings(raster)?,
            cache: build_cache_settings(cache)?,
            errors: build_error_settings(errors)?,
            limits: build_limit_settings(limits)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let backend = match engine.backend {
        Some(value) => EngineBackend::from_str(&value)
            .map_err(|reason| LoadError::invalid("engine.backend", reason))?,
        None => EngineBackend::Katex,
    };

    let worker = build_command(engine.worker_command, engine.worker_args);
    if backend == EngineBackend::Worker && worker.is_none() {
        return Err(LoadError::invalid(
            "engine.worker_command",
            "required when engine.backend is `worker`",
        ));
    }

    let core_capabilities = match engine.core_capabilities {
        Some(names) => {
            let mut names: Vec<String> = names
                .into_iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
            names.sort();
            names.dedup();
            names
        }
        None => DEFAULT_CORE_CAPABILITIES
            .iter()
            .map(|name| name.to_string())
            .collect(),
    };

    Ok(EngineSettings {
        backend,
        worker,
        core_capabilities,
        timeout: timeout(engine.timeout_ms, "engine.timeout_ms")?,
        recover_after_failure: engine.recover_after_failure.unwrap_or(false),
    })
}

fn build_speech_settings(speech: RawSpeechSettings) -> Result<SpeechSettings, LoadError> {
    Ok(SpeechSettings {
        sre: build_command(speech.sre_command, speech.sre_args),
        mathcat: build_command(speech.mathcat_command, speech.mathcat_args),
        timeout: timeout(speech.timeout_ms, "speech.timeout_ms")?,
    })
}

fn build_raster_settings(raster: RawRasterSettings) -> Result<RasterSettings, LoadError> {
    let dpi = raster.dpi.unwrap_or(DEFAULT_DPI);
    if !(MIN_DPI..=MAX_DPI).contains(&dpi) {
        return Err(LoadError::invalid(
            "raster.dpi",
            format!("must be between {MIN_DPI} and {MAX_DPI}"),
        ));
    }

    let max_dimension = raster.max_dimension.unwrap_or(DEFAULT_MAX_DIMENSION);
    if max_dimension == 0 {
        return Err(LoadError::invalid(
            "raster.max_dimension",
            "must be greater than zero",
        ));
    }

    Ok(RasterSettings {
        timeout: timeout(raster.timeout_ms, "raster.timeout_ms")?,
        dpi,
        max_dimension,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let artifact_limit = cache.artifact_limit.unwrap_or(DEFAULT_ARTIFACT_LIMIT);
    if artifact_limit == 0 {
        return Err(LoadError::invalid(
            "cache.artifact_limit",
            "must be greater than zero",
        ));
    }
    let response_limit = cache.response_limit.unwrap_or(DEFAULT_RESPONSE_LIMIT);
    if response_limit == 0 {
        return Err(LoadError::invalid(
            "cache.response_limit",
            "must be greater than zero",
        ));
    }
    let response_max_bytes = cache
        .response_max_bytes
        .unwrap_or(DEFAULT_RESPONSE_MAX_BYTES);
    if response_max_bytes == 0 {
        return Err(LoadError::invalid(
            "cache.response_max_bytes",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        enable_artifact_cache: cache.enable_artifact_cache.unwrap_or(true),
        artifact_limit,
        artifact_ttl_seconds: cache.artifact_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        enable_response_cache: cache.enable_response_cache.unwrap_or(true),
        response_limit,
        response_max_bytes,
        response_ttl_seconds: cache.response_ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
    })
}

fn build_error_settings(errors: RawErrorSettings) -> Result<ErrorSettings, LoadError> {
    let mode = match errors.mode {
        Some(value) => ErrorMode::from_str(&value)
            .map_err(|reason| LoadError::invalid("errors.mode", reason))?,
        None => ErrorMode::Inline,
    };
    let max_message_chars = errors
        .max_message_chars
        .unwrap_or(DEFAULT_MAX_MESSAGE_CHARS);
    if max_message_chars < MIN_MESSAGE_CHARS {
        return Err(LoadError::invalid(
            "errors.max_message_chars",
            format!("must be at least {MIN_MESSAGE_CHARS}"),
        ));
    }

    Ok(ErrorSettings {
        mode,
        max_message_chars,
    })
}

fn build_limit_settings(limits: RawLimitSettings) -> Result<LimitSettings, LoadError> {
    let max_formula_chars = limits
        .max_formula_chars
        .unwrap_or(DEFAULT_MAX_FORMULA_CHARS);
    if max_formula_chars == 0 {
        return Err(LoadError::invalid(
            "limits.max_formula_chars",
            "must be greater than zero",
        ));
    }
    Ok(LimitSettings { max_formula_chars })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    backend: Option<String>,
    worker_command: Option<String>,
    worker_args: Option<Vec<String>>,
    core_capabilities: Option<Vec<String>>,
    timeout_ms: Option<u64>,
    recover_after_failure: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSpeechSettings {
    sre_command: Option<String>,
    sre_args: Option<Vec<String>>,
    mathcat_command: Option<String>,
    mathcat_args: Option<Vec<String>>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRasterSettings {
    timeout_ms: Option<u64>,
    dpi: Option<u32>,
    max_dimension: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enable_artifact_cache: Option<bool>,
    artifact_limit: Option<usize>,
    artifact_ttl_seconds: Option<u64>,
    enable_response_cache: Option<bool>,
    response_limit: Option<usize>,
    response_max_bytes: Option<usize>,
    response_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawErrorSettings {
    mode: Option<String>,
    max_message_chars: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLimitSettings {
    max_formula_chars: Option<usize>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn timeout(value: Option<u64>, key: &'static str) -> Result<Duration, LoadError> {
    let millis = value.unwrap_or(DEFAULT_TIMEOUT_MS);
    if millis == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(millis))
}

fn build_command(program: Option<String>, args: Option<Vec<String>>) -> Option<ProcessCommand> {
    let program = program?.trim().to_string();
    (!program.is_empty()).then(|| ProcessCommand {
        program,
        args: args.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests;
