use std::collections::{BTreeSet, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use serde::Serialize;

use super::formula::{FormulaInput, InputType};

/// Control sequences that need an extension loaded in the engine.
static MACRO_CAPABILITIES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("ce", "mhchem"),
        ("pu", "mhchem"),
        ("cancel", "cancel"),
        ("bcancel", "cancel"),
        ("xcancel", "cancel"),
        ("cancelto", "cancel"),
        ("color", "color"),
        ("textcolor", "color"),
        ("colorbox", "color"),
        ("fcolorbox", "color"),
        ("definecolor", "color"),
        ("bbox", "bbox"),
        ("boldsymbol", "boldsymbol"),
        ("enclose", "enclose"),
        ("unicode", "unicode"),
        ("verb", "verb"),
        ("href", "html"),
        ("url", "html"),
    ])
});

/// Environments that need an extension loaded in the engine.
static ENVIRONMENT_CAPABILITIES: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| HashMap::from([("CD", "amscd")]));

/// Sorted, deduplicated set of engine capabilities a formula requires.
///
/// The empty signature is the default: any loaded engine satisfies it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CapabilitySignature(BTreeSet<String>);

impl CapabilitySignature {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            names
                .into_iter()
                .map(Into::into)
                .map(|name: String| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        )
    }

    /// Signature required by `input`. Only TeX carries capability requirements.
    pub fn from_input(input: &FormulaInput) -> Self {
        match input.input_type() {
            InputType::Tex => Self::from_tex(input.text()),
            InputType::MathMl | InputType::AsciiMath => Self::default(),
        }
    }

    pub fn from_tex(tex: &str) -> Self {
        let mut names = BTreeSet::new();
        let mut rest = tex;

        while let Some(pos) = rest.find('\\') {
            rest = &rest[pos + 1..];
            let name_len = rest
                .char_indices()
                .find(|(_, c)| !c.is_ascii_alphabetic())
                .map(|(idx, _)| idx)
                .unwrap_or(rest.len());

            if name_len == 0 {
                // Escaped symbol such as `\\` or `\{`: skip the escaped character.
                let skip = rest.chars().next().map(char::len_utf8).unwrap_or(0);
                rest = &rest[skip..];
                continue;
            }

            let name = &rest[..name_len];
            rest = &rest[name_len..];

            match name {
                "begin" => {
                    if let Some(env) = braced_argument(rest)
                        && let Some(capability) = ENVIRONMENT_CAPABILITIES.get(env.trim())
                    {
                        names.insert((*capability).to_string());
                    }
                }
                "require" => {
                    if let Some(arg) = braced_argument(rest) {
                        let package = arg.trim();
                        if !package.is_empty()
                            && package
                                .chars()
                                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                        {
                            names.insert(package.to_string());
                        }
                    }
                }
                other => {
                    if let Some(capability) = MACRO_CAPABILITIES.get(other) {
                        names.insert((*capability).to_string());
                    }
                }
            }
        }

        Self(names)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union of `core` and this signature, used to construct an engine.
    pub fn with_core(&self, core: &[String]) -> Vec<String> {
        let mut all: BTreeSet<String> = core.iter().cloned().collect();
        all.extend(self.0.iter().cloned());
        all.into_iter().collect()
    }
}

impl fmt::Display for CapabilitySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("default");
        }
        let joined = self.0.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        f.write_str(&joined)
    }
}

fn braced_argument(text: &str) -> Option<&str> {
    let trimmed = text.trim_start();
    let inner = trimmed.strip_prefix('{')?;
    let end = inner.find('}')?;
    Some(&inner[..end])
}
