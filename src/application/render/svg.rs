//! SVG fragment handling: metric extraction, splitting into definitions and
//! body, and final cleanup of the delivered document.

use std::cell::RefCell;
use std::rc::Rc;

use lol_html::html_content::ContentType;
use lol_html::{RewriteStrSettings, element, rewrite_str};

use crate::domain::error::FormulaError;
use crate::domain::options::DEFAULT_EX_PX;

use super::types::{EngineError, Fragment, FragmentMetrics, ViewBox};

/// Private-use markers delimiting extracted definitions in rewritten output.
const DEF_START: char = '\u{E000}';
const DEF_END: char = '\u{E001}';

/// Attributes that only serve assistive technology or engine internals.
const STRIPPED_PREFIXES: [&str; 3] = ["aria-", "data-semantic-", "data-mjx-"];
const STRIPPED_NAMES: [&str; 4] = ["role", "focusable", "data-mml-node", "data-c"];

/// Root `<svg>` attributes in document order.
pub(crate) type Attributes = Vec<(String, String)>;

/// A fragment taken apart for composition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SplitSvg {
    pub root: Attributes,
    /// Outer markup of every definition, in document order.
    pub defs: Vec<String>,
    /// Drawable content of the root element without its definitions.
    pub body: String,
}

impl Fragment {
    /// Parse a complete `<svg>` document emitted by an engine.
    pub fn from_svg(svg: impl Into<String>) -> Result<Self, EngineError> {
        let svg = svg.into();
        let root = root_attributes(&svg)
            .map_err(|err| EngineError::render(err.to_string()))?
            .ok_or_else(|| EngineError::protocol("fragment has no <svg> root"))?;
        let metrics = metrics_from_attributes(&root)?;
        Ok(Self { svg, metrics })
    }
}

fn attribute<'a>(attributes: &'a Attributes, name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn metrics_from_attributes(root: &Attributes) -> Result<FragmentMetrics, EngineError> {
    let view_box = attribute(root, "viewBox")
        .and_then(parse_view_box)
        .ok_or_else(|| EngineError::protocol("fragment has no valid viewBox"))?;
    let width_ex = attribute(root, "width").and_then(parse_length_ex).unwrap_or(0.0);
    let height_ex = attribute(root, "height")
        .and_then(parse_length_ex)
        .unwrap_or(0.0);
    let vertical_align_ex = attribute(root, "style")
        .and_then(|style| style_property(style, "vertical-align"))
        .and_then(parse_length_ex)
        .unwrap_or(0.0);

    Ok(FragmentMetrics {
        width_ex,
        height_ex,
        vertical_align_ex,
        view_box,
    })
}

fn root_attributes(svg: &str) -> Result<Option<Attributes>, FormulaError> {
    let root: Rc<RefCell<Option<Attributes>>> = Rc::new(RefCell::new(None));

    rewrite_str(
        svg,
        RewriteStrSettings {
            element_content_handlers: vec![element!("svg", {
                let root = Rc::clone(&root);
                move |el| {
                    let mut root = root.borrow_mut();
                    if root.is_none() {
                        *root = Some(
                            el.attributes()
                                .iter()
                                .map(|attr| (attr.name(), attr.value()))
                                .collect(),
                        );
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| FormulaError::conversion(format!("invalid SVG fragment: {err}")))?;

    Ok(root.borrow_mut().take())
}

/// Separate a fragment into root attributes, definitions and body.
pub(crate) fn split(svg: &str) -> Result<SplitSvg, FormulaError> {
    let clean: String = svg.chars().filter(|c| *c != DEF_START && *c != DEF_END).collect();
    let root: Rc<RefCell<Option<Attributes>>> = Rc::new(RefCell::new(None));

    let rewritten = rewrite_str(
        &clean,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("svg", {
                    let root = Rc::clone(&root);
                    move |el| {
                        let mut root = root.borrow_mut();
                        if root.is_none() {
                            *root = Some(
                                el.attributes()
                                    .iter()
                                    .map(|attr| (attr.name(), attr.value()))
                                    .collect(),
                            );
                            el.remove_and_keep_content();
                        }
                        Ok(())
                    }
                }),
                element!("defs", |el| {
                    el.remove_and_keep_content();
                    Ok(())
                }),
                element!("defs > *, svg > style", |el| {
                    el.before(&DEF_START.to_string(), ContentType::Html);
                    el.after(&DEF_END.to_string(), ContentType::Html);
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| FormulaError::conversion(format!("invalid SVG fragment: {err}")))?;

    let root = root
        .borrow_mut()
        .take()
        .ok_or_else(|| FormulaError::conversion("fragment has no <svg> root"))?;

    let mut defs = Vec::new();
    let mut body = String::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in rewritten.chars() {
        match c {
            DEF_START => depth += 1,
            DEF_END => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    defs.push(std::mem::take(&mut current));
                }
            }
            _ if depth > 0 => current.push(c),
            _ => body.push(c),
        }
    }

    Ok(SplitSvg {
        root,
        defs,
        body: body.trim().to_string(),
    })
}

/// Final cleanup of a delivered document: strip assistive-only attributes,
/// apply the size multiplier to the root and set the drawing color.
pub fn finalize(svg: &str, scale: f64, color: Option<&str>) -> Result<String, FormulaError> {
    let seen_root = Rc::new(RefCell::new(false));

    rewrite_str(
        svg,
        RewriteStrSettings {
            element_content_handlers: vec![element!("*", {
                let seen_root = Rc::clone(&seen_root);
                move |el| {
                    let stripped: Vec<String> = el
                        .attributes()
                        .iter()
                        .map(|attr| attr.name())
                        .filter(|name| is_assistive_attribute(name))
                        .collect();
                    for name in stripped {
                        el.remove_attribute(&name);
                    }

                    let mut seen_root = seen_root.borrow_mut();
                    if *seen_root || !el.tag_name().eq_ignore_ascii_case("svg") {
                        return Ok(());
                    }
                    *seen_root = true;

                    if (scale - 1.0).abs() > f64::EPSILON {
                        for name in ["width", "height"] {
                            if let Some(value) = el.get_attribute(name)
                                && let Some(scaled) = scale_length(&value, scale)
                            {
                                el.set_attribute(name, &scaled)?;
                            }
                        }
                    }

                    if let Some(color) = color {
                        let style = el.get_attribute("style").unwrap_or_default();
                        let style = style.trim().trim_end_matches(';').trim();
                        let merged = if style.is_empty() {
                            format!("color: {color}")
                        } else {
                            format!("{style}; color: {color}")
                        };
                        el.set_attribute("style", &merged)?;
                    }
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| FormulaError::conversion(format!("SVG cleanup failed: {err}")))
}

fn is_assistive_attribute(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    STRIPPED_NAMES.contains(&lower.as_str())
        || STRIPPED_PREFIXES
            .iter()
            .any(|prefix| lower.starts_with(prefix))
}

/// Parse `min-x min-y width height`, separated by whitespace and/or commas.
pub(crate) fn parse_view_box(value: &str) -> Option<ViewBox> {
    let numbers: Vec<f64> = value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
        .map(str::parse::<f64>)
        .collect::<Result<_, _>>()
        .ok()?;
    match numbers.as_slice() {
        [min_x, min_y, width, height] if *width >= 0.0 && *height >= 0.0 => Some(ViewBox {
            min_x: *min_x,
            min_y: *min_y,
            width: *width,
            height: *height,
        }),
        _ => None,
    }
}

/// Split a CSS length into its number and unit.
fn split_length(value: &str) -> Option<(f64, &str)> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e'))
        .unwrap_or(value.len());
    // `e` is ambiguous with the `em`/`ex` units; back off when followed by m/x.
    let split = if split > 0
        && value[..split].ends_with('e')
        && value[split..].starts_with(['m', 'x'])
    {
        split - 1
    } else {
        split
    };
    let number = value[..split].parse::<f64>().ok()?;
    Some((number, value[split..].trim()))
}

/// Length in ex. Pixel lengths use the default ex size; `em` counts as 2 ex.
pub(crate) fn parse_length_ex(value: &str) -> Option<f64> {
    let (number, unit) = split_length(value)?;
    match unit {
        "ex" | "" => Some(number),
        "px" => Some(number / DEFAULT_EX_PX),
        "em" => Some(number * 2.0),
        _ => None,
    }
}

fn scale_length(value: &str, scale: f64) -> Option<String> {
    let (number, unit) = split_length(value)?;
    Some(format!("{}{unit}", format_number(number * scale)))
}

fn style_property<'a>(style: &'a str, property: &str) -> Option<&'a str> {
    style.split(';').find_map(|declaration| {
        let (name, value) = declaration.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case(property)
            .then_some(value.trim())
    })
}

/// Format a coordinate with at most three decimals and no trailing zeros.
pub(crate) fn format_number(value: f64) -> String {
    let formatted = format!("{value:.3}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" || trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
