use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Serialize;

use super::error::FormulaError;

pub const MISSING_FORMULA_MESSAGE: &str =
    "Missing required parameter: one of tex, mml, asciimath (or tex64, mml64, asciimath64)";

/// Markup dialect of an incoming formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Tex,
    MathMl,
    AsciiMath,
}

impl InputType {
    pub const ALL: [InputType; 3] = [InputType::Tex, InputType::MathMl, InputType::AsciiMath];

    /// Query parameter carrying the raw formula.
    pub fn query_name(self) -> &'static str {
        match self {
            InputType::Tex => "tex",
            InputType::MathMl => "mml",
            InputType::AsciiMath => "asciimath",
        }
    }

    /// Query parameter carrying the base64url-encoded formula.
    pub fn encoded_query_name(self) -> &'static str {
        match self {
            InputType::Tex => "tex64",
            InputType::MathMl => "mml64",
            InputType::AsciiMath => "asciimath64",
        }
    }

    pub fn as_str(self) -> &'static str {
        self.query_name()
    }
}

/// A validated formula: non-empty, within the configured length bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FormulaInput {
    input_type: InputType,
    text: String,
}

impl FormulaInput {
    pub fn new(
        input_type: InputType,
        text: impl Into<String>,
        max_chars: usize,
    ) -> Result<Self, FormulaError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(FormulaError::input(format!(
                "Missing required parameter: `{}` must not be empty",
                input_type.query_name()
            )));
        }
        let length = text.chars().count();
        if length > max_chars {
            return Err(FormulaError::input(format!(
                "formula is too long ({length} characters, limit {max_chars})"
            )));
        }
        Ok(Self { input_type, text })
    }

    pub fn input_type(&self) -> InputType {
        self.input_type
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Encode a formula for transport in a `*64` query parameter.
pub fn encode_formula(text: &str) -> String {
    URL_SAFE_NO_PAD.encode(text.as_bytes())
}

/// Decode a `*64` query parameter. Non-canonical or non-UTF-8 payloads are rejected.
pub fn decode_formula(encoded: &str) -> Result<String, FormulaError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|err| FormulaError::input(format!("invalid encoded formula: {err}")))?;
    String::from_utf8(bytes)
        .map_err(|_| FormulaError::input("invalid encoded formula: payload is not valid UTF-8"))
}
