//! In-process TeX backend built on KaTeX.
//!
//! KaTeX emits MathML rather than vector paths, so each top-level line of
//! the formula becomes one fragment holding the MathML inside a
//! `<foreignObject>`, sized from a character-count estimate.

use std::sync::Arc;

use async_trait::async_trait;
use katex::{OptsBuilder, OutputType};
use tracing::debug;

use crate::application::render::svg::format_number;
use crate::application::render::{EngineError, EngineFactory, Fragment, MathEngine};
use crate::domain::formula::{FormulaInput, InputType};
use crate::domain::options::EngineOptions;

const SOURCE: &str = "mathgate::infra::engines::katex";

/// View-box units per ex.
const UNITS_PER_EX: f64 = 500.0;
const EX_PER_CHAR: f64 = 1.1;
const INLINE_HEIGHT_EX: f64 = 2.6;
const DISPLAY_HEIGHT_EX: f64 = 3.2;
const DEPTH_EX: f64 = 0.6;

/// Capabilities KaTeX provides natively.
const SUPPORTED: [&str; 9] = [
    "base",
    "ams",
    "newcommand",
    "noundefined",
    "cancel",
    "color",
    "boldsymbol",
    "amscd",
    "html",
];

pub struct KatexEngine {
    trust: bool,
}

impl KatexEngine {
    fn mathml(&self, tex: String, display: bool) -> Result<String, EngineError> {
        let mut builder = OptsBuilder::default();
        builder.display_mode(display);
        builder.output_type(OutputType::Mathml);
        builder.trust(self.trust);

        let opts = builder
            .build()
            .map_err(|err| EngineError::render(format!("failed to build KaTeX options: {err}")))?;
        let html = katex::render_with_opts(&tex, opts)
            .map_err(|err| EngineError::render(format!("KaTeX rendering failed: {err}")))?;
        extract_math(&html)
    }

    async fn mathml_blocking(&self, tex: String, display: bool) -> Result<String, EngineError> {
        let engine = KatexEngine { trust: self.trust };
        tokio::task::spawn_blocking(move || engine.mathml(tex, display))
            .await
            .map_err(|err| EngineError::protocol(format!("KaTeX task failed: {err}")))?
    }
}

#[async_trait]
impl MathEngine for KatexEngine {
    async fn ready(&self) -> Result<(), EngineError> {
        self.mathml_blocking("x".to_string(), false)
            .await
            .map(|_| ())
            .map_err(|err| EngineError::startup(err.to_string()))
    }

    async fn render_svg(
        &self,
        input: &FormulaInput,
        options: &EngineOptions,
    ) -> Result<Vec<Fragment>, EngineError> {
        if input.input_type() != InputType::Tex {
            return Err(EngineError::unsupported(format!(
                "{} input",
                input.input_type().as_str()
            )));
        }

        let mut fragments = Vec::new();
        for line in split_lines(input.text()) {
            let mathml = self.mathml_blocking(line.clone(), options.display).await?;
            fragments.push(Fragment::from_svg(wrap_fragment(
                &line,
                &mathml,
                options.display,
            ))?);
        }
        debug!(
            target = SOURCE,
            fragments = fragments.len(),
            display = options.display,
            "formula rendered with KaTeX"
        );
        Ok(fragments)
    }

    async fn to_mathml(&self, input: &FormulaInput) -> Result<String, EngineError> {
        match input.input_type() {
            InputType::Tex => self.mathml_blocking(input.text().to_string(), true).await,
            InputType::MathMl => Ok(input.text().to_string()),
            InputType::AsciiMath => Err(EngineError::unsupported("asciimath input")),
        }
    }

    async fn shutdown(&self) {}
}

/// Builds KaTeX engines. Capabilities KaTeX lacks are logged and left to
/// fail per formula, so a single exotic request cannot wedge the engine.
#[derive(Debug, Default, Clone)]
pub struct KatexEngineFactory;

#[async_trait]
impl EngineFactory for KatexEngineFactory {
    async fn create(&self, capabilities: &[String]) -> Result<Arc<dyn MathEngine>, EngineError> {
        let missing: Vec<&str> = capabilities
            .iter()
            .map(String::as_str)
            .filter(|name| !SUPPORTED.contains(name))
            .collect();
        if !missing.is_empty() {
            debug!(
                target = SOURCE,
                missing = ?missing,
                "KaTeX has no support for requested capabilities"
            );
        }
        let trust = capabilities.iter().any(|name| name == "html");
        Ok(Arc::new(KatexEngine { trust }))
    }
}

/// Top-level `\\` line breaks, ignoring those nested in groups or environments.
fn split_lines(tex: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut braces = 0usize;
    let mut environments = 0usize;
    let mut rest = tex;

    while let Some(c) = rest.chars().next() {
        if c == '\\' {
            let tail = &rest[1..];
            if tail.starts_with('\\') && braces == 0 && environments == 0 {
                lines.push(std::mem::take(&mut current));
                rest = &tail[1..];
                continue;
            }
            if tail.starts_with("begin") {
                environments += 1;
            } else if tail.starts_with("end") {
                environments = environments.saturating_sub(1);
            }
            // Keep escaped characters such as `\{` out of the brace count.
            let escaped_len = tail.chars().next().map_or(0, char::len_utf8);
            current.push_str(&rest[..1 + escaped_len]);
            rest = &tail[escaped_len..];
            continue;
        }
        match c {
            '{' => braces += 1,
            '}' => braces = braces.saturating_sub(1),
            _ => {}
        }
        current.push(c);
        rest = &rest[c.len_utf8()..];
    }
    lines.push(current);

    let lines: Vec<String> = lines
        .into_iter()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        vec![tex.trim().to_string()]
    } else {
        lines
    }
}

fn extract_math(html: &str) -> Result<String, EngineError> {
    let start = html
        .find("<math")
        .ok_or_else(|| EngineError::protocol("KaTeX output has no <math> element"))?;
    let end = html
        .rfind("</math>")
        .ok_or_else(|| EngineError::protocol("KaTeX output has an unterminated <math>"))?;
    Ok(html[start..end + "</math>".len()].to_string())
}

fn wrap_fragment(tex: &str, mathml: &str, display: bool) -> String {
    let visible = tex
        .split('\\')
        .enumerate()
        .map(|(index, part)| match index {
            0 => part,
            // Command names are not drawn.
            _ => part.trim_start_matches(char::is_alphabetic),
        })
        .flat_map(str::chars)
        .filter(|c| !c.is_whitespace() && !matches!(c, '{' | '}' | '^' | '_'))
        .count()
        .max(1);
    let width_ex = visible as f64 * EX_PER_CHAR;
    let height_ex = if display {
        DISPLAY_HEIGHT_EX
    } else {
        INLINE_HEIGHT_EX
    };

    let width = width_ex * UNITS_PER_EX;
    let height = height_ex * UNITS_PER_EX;
    let min_y = -(height_ex - DEPTH_EX) * UNITS_PER_EX;

    format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w_ex}ex" height="{h_ex}ex" "#,
            r#"style="vertical-align: -{depth}ex" viewBox="0 {min_y} {w} {h}">"#,
            r#"<foreignObject x="0" y="{min_y}" width="{w}" height="{h}">{mathml}</foreignObject>"#,
            "</svg>"
        ),
        w_ex = format_number(width_ex),
        h_ex = format_number(height_ex),
        depth = format_number(DEPTH_EX),
        min_y = format_number(min_y),
        w = format_number(width),
        h = format_number(height),
        mathml = mathml,
    )
}
