use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the mathgate binary.
#[derive(Debug, Parser)]
#[command(name = "mathgate", version, about = "Formula rendering service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MATHGATE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service (default).
    Serve(Box<ServeArgs>),
    /// Render one formula to stdout or a file without starting the server.
    Render(RenderArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the bind host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the bind port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long = "log-json", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    pub log_json: Option<bool>,

    /// Override the rendering backend (katex or worker).
    #[arg(long = "engine-backend", value_name = "BACKEND")]
    pub engine_backend: Option<String>,

    /// Override how failures are reported (inline or status).
    #[arg(long = "errors-mode", value_name = "MODE")]
    pub errors_mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InputDialect {
    Tex,
    Mml,
    Asciimath,
}

impl InputDialect {
    pub fn query_name(self) -> &'static str {
        match self {
            InputDialect::Tex => "tex",
            InputDialect::Mml => "mml",
            InputDialect::Asciimath => "asciimath",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RenderFormat {
    Svg,
    Png,
    Speech,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    /// Formula text.
    #[arg(value_name = "FORMULA")]
    pub formula: String,

    /// Markup dialect of the formula.
    #[arg(long, value_enum, default_value_t = InputDialect::Tex)]
    pub input: InputDialect,

    /// Output format.
    #[arg(long, value_enum, default_value_t = RenderFormat::Svg)]
    pub format: RenderFormat,

    /// Extra request option as `name=value` (scale, display, chunk, dpi, ...).
    #[arg(long = "option", short = 'o', value_name = "NAME=VALUE")]
    pub options: Vec<String>,

    /// Write the artifact here instead of stdout.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: RenderOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the rendering backend (katex or worker).
    #[arg(long = "engine-backend", value_name = "BACKEND")]
    pub engine_backend: Option<String>,

    /// Override the log level.
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl RenderArgs {
    /// Query-style pairs equivalent to this invocation.
    pub fn query_pairs(&self) -> Result<Vec<(String, String)>, String> {
        let mut pairs = vec![(self.input.query_name().to_string(), self.formula.clone())];
        match self.format {
            RenderFormat::Svg => {}
            RenderFormat::Png => pairs.push(("png".to_string(), "true".to_string())),
            RenderFormat::Speech => pairs.push(("speech".to_string(), "true".to_string())),
        }
        for option in &self.options {
            let (name, value) = option
                .split_once('=')
                .ok_or_else(|| format!("option `{option}` must look like name=value"))?;
            pairs.push((name.trim().to_string(), value.to_string()));
        }
        Ok(pairs)
    }
}
