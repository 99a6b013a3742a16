//! Request options: parsing, defaulting and validation of query parameters.
//!
//! A [`FormulaRequest`] is the fully-defaulted, validated form of a request.
//! Two requests that differ only in parameter order or in the spelling of
//! boolean values produce equal `FormulaRequest`s, which is what cache keys
//! are derived from.

use std::collections::BTreeMap;

use serde::Serialize;

use super::error::FormulaError;
use super::formula::{FormulaInput, InputType, MISSING_FORMULA_MESSAGE, decode_formula};

pub const DEFAULT_EM_PX: f64 = 16.0;
pub const DEFAULT_EX_PX: f64 = 8.0;
pub const DEFAULT_DPI: u32 = 96;
const MAX_SCALE: f64 = 20.0;
const MIN_DPI: u32 = 16;
const MAX_DPI: u32 = 600;
const MAX_COLOR_LEN: usize = 64;

/// Output class requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Svg,
    Png,
    Speech,
}

impl OutputFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Svg => "image/svg+xml; charset=utf-8",
            OutputFormat::Png => "image/png",
            OutputFormat::Speech => "text/plain; charset=utf-8",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Svg => "svg",
            OutputFormat::Png => "png",
            OutputFormat::Speech => "speech",
        }
    }

    /// Best-effort detection used when the request itself fails validation.
    ///
    /// Never fails: the fallback artifact still needs a content type.
    pub fn detect(params: &[(String, String)]) -> Self {
        let flag = |name: &str| {
            params
                .iter()
                .any(|(key, value)| key == name && parse_boolish(value).unwrap_or(false))
        };
        if flag("png") {
            OutputFormat::Png
        } else if flag("speech") {
            OutputFormat::Speech
        } else {
            OutputFormat::Svg
        }
    }
}

/// Speech engine implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechEngineKind {
    Sre,
    MathCat,
}

impl SpeechEngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SpeechEngineKind::Sre => "sre",
            SpeechEngineKind::MathCat => "mathcat",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sre" => Some(SpeechEngineKind::Sre),
            "mathcat" => Some(SpeechEngineKind::MathCat),
            _ => None,
        }
    }

    fn default_style(self) -> &'static str {
        match self {
            SpeechEngineKind::Sre => "mathspeak",
            SpeechEngineKind::MathCat => "ClearSpeak",
        }
    }

    fn default_verbosity(self) -> &'static str {
        match self {
            SpeechEngineKind::Sre => "default",
            SpeechEngineKind::MathCat => "Medium",
        }
    }

    /// Supported styles paired with the verbosities each one accepts.
    fn combinations(self) -> &'static [(&'static str, &'static [&'static str])] {
        match self {
            SpeechEngineKind::Sre => &[
                ("mathspeak", &["default", "brief", "sbrief"]),
                ("clearspeak", &["default"]),
            ],
            SpeechEngineKind::MathCat => &[
                ("ClearSpeak", &["Terse", "Medium", "Verbose"]),
                ("SimpleSpeak", &["Terse", "Medium", "Verbose"]),
            ],
        }
    }

    fn locales(self) -> &'static [&'static str] {
        match self {
            SpeechEngineKind::Sre => &[
                "en", "de", "es", "fr", "it", "hi", "ko", "nb", "nn", "sv", "da", "ca",
            ],
            SpeechEngineKind::MathCat => &["en", "es", "fi", "id", "vi", "zh-tw"],
        }
    }
}

/// Options forwarded to the rendering engine; part of the artifact cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineOptions {
    pub display: bool,
    pub em: f64,
    pub ex: f64,
    pub container_width: Option<f64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            display: true,
            em: DEFAULT_EM_PX,
            ex: DEFAULT_EX_PX,
            container_width: None,
        }
    }
}

/// Options applied to the composed vector document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresentationOptions {
    pub scale: f64,
    pub chunk: Option<usize>,
    pub color: Option<String>,
}

impl Default for PresentationOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
            chunk: None,
            color: None,
        }
    }
}

/// Raster output parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RasterOptions {
    pub dpi: u32,
    pub width: Option<u32>,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            dpi: DEFAULT_DPI,
            width: None,
        }
    }
}

/// Speech parameters, validated against the selected engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SpeechOptions {
    pub engine: SpeechEngineKind,
    pub style: String,
    pub verbosity: String,
    pub locale: String,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        let engine = SpeechEngineKind::Sre;
        Self {
            engine,
            style: engine.default_style().to_string(),
            verbosity: engine.default_verbosity().to_string(),
            locale: "en".to_string(),
        }
    }
}

impl SpeechOptions {
    pub fn new(
        engine: SpeechEngineKind,
        style: Option<&str>,
        verbosity: Option<&str>,
        locale: Option<&str>,
    ) -> Result<Self, FormulaError> {
        let requested_style = style.unwrap_or(engine.default_style());
        let (style, verbosities) = engine
            .combinations()
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(requested_style.trim()))
            .ok_or_else(|| {
                FormulaError::option(format!(
                    "speech style `{requested_style}` is not supported by {}",
                    engine.as_str()
                ))
            })?;

        let requested_verbosity = verbosity.unwrap_or(verbosities[0]);
        let verbosity = verbosities
            .iter()
            .find(|name| name.eq_ignore_ascii_case(requested_verbosity.trim()))
            .ok_or_else(|| {
                FormulaError::option(format!(
                    "verbosity `{requested_verbosity}` is not supported for {} style `{style}`",
                    engine.as_str()
                ))
            })?;

        let requested_locale = locale.unwrap_or("en").trim().to_ascii_lowercase();
        if !engine.locales().contains(&requested_locale.as_str()) {
            return Err(FormulaError::option(format!(
                "locale `{requested_locale}` is not supported by {}",
                engine.as_str()
            )));
        }

        Ok(Self {
            engine,
            style: (*style).to_string(),
            verbosity: (*verbosity).to_string(),
            locale: requested_locale,
        })
    }
}

/// Limits and server-side defaults applied while parsing requests.
#[derive(Debug, Clone, Copy)]
pub struct InputLimits {
    pub max_formula_chars: usize,
    pub max_raster_width: u32,
    /// Resolution used when a PNG request names no `dpi`.
    pub default_dpi: u32,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_formula_chars: 20_000,
            max_raster_width: 4096,
            default_dpi: DEFAULT_DPI,
        }
    }
}

/// Fully-defaulted, validated formula request.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaRequest {
    pub input: FormulaInput,
    pub format: OutputFormat,
    pub engine: EngineOptions,
    pub presentation: PresentationOptions,
    pub raster: RasterOptions,
    pub speech: SpeechOptions,
}

impl FormulaRequest {
    /// Build a request with default options, as used by the CLI.
    pub fn new(input: FormulaInput, format: OutputFormat) -> Self {
        Self {
            input,
            format,
            engine: EngineOptions::default(),
            presentation: PresentationOptions::default(),
            raster: RasterOptions::default(),
            speech: SpeechOptions::default(),
        }
    }

    /// Parse raw query pairs. Unknown parameters are ignored; a repeated parameter keeps its last value.
    pub fn from_query(
        params: &[(String, String)],
        limits: &InputLimits,
    ) -> Result<Self, FormulaError> {
        let params: BTreeMap<&str, &str> = params
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();

        let input = parse_input(&params, limits)?;
        let format = parse_format(&params)?;

        let mut engine = EngineOptions::default();
        if let Some(value) = params.get("display") {
            engine.display = boolish("display", value)?;
        }
        if let Some(value) = params.get("em") {
            engine.em = positive_number("em", value, None)?;
        }
        if let Some(value) = params.get("ex") {
            engine.ex = positive_number("ex", value, None)?;
        }
        if let Some(value) = params.get("width") {
            engine.container_width = Some(positive_number("width", value, None)?);
        }

        let mut presentation = PresentationOptions::default();
        if let Some(value) = params.get("scale") {
            presentation.scale = positive_number("scale", value, Some(MAX_SCALE))?;
        }
        if let Some(value) = params.get("chunk") {
            let chunk = value.trim().parse::<usize>().map_err(|_| {
                FormulaError::option(format!("`chunk` must be a non-negative integer, got `{value}`"))
            })?;
            presentation.chunk = Some(chunk);
        }
        if let Some(value) = params.get("color") {
            presentation.color = Some(parse_color(value)?);
        }

        let mut raster = RasterOptions {
            dpi: limits.default_dpi,
            ..RasterOptions::default()
        };
        if let Some(value) = params.get("dpi") {
            let dpi = value.trim().parse::<u32>().map_err(|_| {
                FormulaError::option(format!("`dpi` must be an integer, got `{value}`"))
            })?;
            if !(MIN_DPI..=MAX_DPI).contains(&dpi) {
                return Err(FormulaError::option(format!(
                    "`dpi` must be between {MIN_DPI} and {MAX_DPI}"
                )));
            }
            raster.dpi = dpi;
        }
        if let Some(value) = params.get("pngwidth") {
            let width = value.trim().parse::<u32>().map_err(|_| {
                FormulaError::option(format!("`pngwidth` must be an integer, got `{value}`"))
            })?;
            if width == 0 || width > limits.max_raster_width {
                return Err(FormulaError::option(format!(
                    "`pngwidth` must be between 1 and {}",
                    limits.max_raster_width
                )));
            }
            raster.width = Some(width);
        }

        let speech_engine = match params.get("engine") {
            Some(value) => SpeechEngineKind::parse(value).ok_or_else(|| {
                FormulaError::option(format!("unknown speech engine `{value}`"))
            })?,
            None => SpeechEngineKind::Sre,
        };
        let speech = SpeechOptions::new(
            speech_engine,
            params.get("style").copied(),
            params.get("verbosity").copied(),
            params.get("locale").copied(),
        )?;

        Ok(Self {
            input,
            format,
            engine,
            presentation,
            raster,
            speech,
        })
    }
}

/// Parse a boolean-like query value. Accepts `true/1/yes/on` and `false/0/no/off` in any case.
pub fn parse_boolish(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_input(
    params: &BTreeMap<&str, &str>,
    limits: &InputLimits,
) -> Result<FormulaInput, FormulaError> {
    let mut found: Option<(InputType, String)> = None;
    for input_type in InputType::ALL {
        let raw = params
            .get(input_type.query_name())
            .map(|value| Ok((*value).to_string()));
        let encoded = params
            .get(input_type.encoded_query_name())
            .map(|value| decode_formula(value));

        for candidate in [raw, encoded].into_iter().flatten() {
            let text = candidate?;
            if found.is_some() {
                return Err(FormulaError::input(
                    "exactly one formula parameter may be supplied",
                ));
            }
            found = Some((input_type, text));
        }
    }

    let (input_type, text) = found.ok_or_else(|| FormulaError::input(MISSING_FORMULA_MESSAGE))?;
    FormulaInput::new(input_type, text, limits.max_formula_chars)
}

fn parse_format(params: &BTreeMap<&str, &str>) -> Result<OutputFormat, FormulaError> {
    let mut selected = Vec::new();
    for (name, format) in [
        ("svg", OutputFormat::Svg),
        ("png", OutputFormat::Png),
        ("speech", OutputFormat::Speech),
    ] {
        if let Some(value) = params.get(name)
            && boolish(name, value)?
        {
            selected.push(format);
        }
    }

    match selected.as_slice() {
        [] => Ok(OutputFormat::Svg),
        [format] => Ok(*format),
        _ => Err(FormulaError::option(
            "only one of `svg`, `png`, `speech` may be requested",
        )),
    }
}

fn boolish(name: &str, value: &str) -> Result<bool, FormulaError> {
    parse_boolish(value).ok_or_else(|| {
        FormulaError::option(format!("`{name}` must be a boolean, got `{value}`"))
    })
}

fn positive_number(name: &str, value: &str, max: Option<f64>) -> Result<f64, FormulaError> {
    let number = value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite() && *number > 0.0)
        .ok_or_else(|| {
            FormulaError::option(format!("`{name}` must be a positive number, got `{value}`"))
        })?;
    if let Some(max) = max
        && number > max
    {
        return Err(FormulaError::option(format!("`{name}` must not exceed {max}")));
    }
    Ok(number)
}

fn parse_color(value: &str) -> Result<String, FormulaError> {
    let trimmed = value.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_COLOR_LEN
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "#(),.% ".contains(c));
    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(FormulaError::option(format!("`color` is not a valid color: `{value}`")))
    }
}
