//! Chunk compositor: stitches independently rendered fragments into one
//! document.
//!
//! Fragments are laid out left to right in emission order, separated by a
//! fixed margin, on a shared vertical band so their baselines line up the
//! way they would inline. Definitions from all fragments are merged into a
//! single `<defs>` block.

use std::collections::HashSet;

use crate::domain::error::FormulaError;

use super::svg::{SplitSvg, format_number, split};
use super::types::Fragment;

/// Horizontal gap between consecutive fragments, in ex.
pub const FRAGMENT_MARGIN_EX: f64 = 0.5;

const SVG_NS: &str = "http://www.w3.org/2000/svg";
const XLINK_NS: &str = "http://www.w3.org/1999/xlink";

/// Definition kinds deduplicated by content rather than identifier.
const STRUCTURAL_KINDS: [&str; 7] = [
    "lineargradient",
    "radialgradient",
    "clippath",
    "mask",
    "filter",
    "pattern",
    "style",
];

/// Pick a single fragment by 0-based index.
pub fn select_chunk(fragments: &[Fragment], index: usize) -> Result<&Fragment, FormulaError> {
    fragments.get(index).ok_or_else(|| {
        FormulaError::option(format!(
            "`chunk` {index} is out of range: formula rendered {} chunk(s)",
            fragments.len()
        ))
    })
}

/// Combine `fragments` into one SVG document. Inputs are not modified.
///
/// A single fragment is returned as-is.
pub fn compose(fragments: &[Fragment]) -> Result<String, FormulaError> {
    match fragments {
        [] => Err(FormulaError::conversion("engine produced no output")),
        [single] => Ok(single.svg.clone()),
        _ => compose_many(fragments),
    }
}

struct Placement {
    x: f64,
    y: f64,
}

fn compose_many(fragments: &[Fragment]) -> Result<String, FormulaError> {
    let parts: Vec<SplitSvg> = fragments
        .iter()
        .map(|fragment| split(&fragment.svg))
        .collect::<Result<_, _>>()?;

    let global_min_y = fragments
        .iter()
        .map(|fragment| fragment.metrics.view_box.min_y)
        .fold(f64::INFINITY, f64::min);
    let global_max_y = fragments
        .iter()
        .map(|fragment| fragment.metrics.view_box.max_y())
        .fold(f64::NEG_INFINITY, f64::max);

    let mut placements = Vec::with_capacity(fragments.len());
    let mut cursor = 0.0;
    let mut width_ex = 0.0;
    let mut previous_had_width = false;
    for (index, fragment) in fragments.iter().enumerate() {
        let metrics = &fragment.metrics;
        if index > 0 && previous_had_width {
            cursor += FRAGMENT_MARGIN_EX * metrics.scale();
            width_ex += FRAGMENT_MARGIN_EX;
        }
        placements.push(Placement {
            x: cursor,
            y: metrics.view_box.min_y - global_min_y,
        });
        cursor += metrics.view_box.width;
        width_ex += metrics.width_ex;
        previous_had_width = metrics.width_ex > 0.0;
    }

    let height_ex = fragments
        .iter()
        .map(|fragment| fragment.metrics.height_ex)
        .fold(0.0, f64::max);
    let vertical_align_ex = fragments
        .iter()
        .map(|fragment| fragment.metrics.vertical_align_ex)
        .fold(0.0, f64::min);
    let band = global_max_y - global_min_y;

    let mut out = String::new();
    out.push_str(&format!(
        r#"<svg xmlns="{SVG_NS}" xmlns:xlink="{XLINK_NS}" width="{}ex" height="{}ex" style="vertical-align: {}ex" viewBox="0 0 {} {}">"#,
        format_number(width_ex),
        format_number(height_ex),
        format_number(vertical_align_ex),
        format_number(cursor),
        format_number(band),
    ));

    let defs = merge_definitions(parts.iter().flat_map(|part| part.defs.iter()));
    if !defs.is_empty() {
        out.push_str("<defs>");
        for def in defs {
            out.push_str(def);
        }
        out.push_str("</defs>");
    }

    for ((fragment, part), placement) in fragments.iter().zip(&parts).zip(&placements) {
        let view_box = &fragment.metrics.view_box;
        out.push_str(&format!(
            r#"<svg x="{}" y="{}" width="{}" height="{}" viewBox="{} {} {} {}" overflow="visible">"#,
            format_number(placement.x),
            format_number(placement.y),
            format_number(view_box.width),
            format_number(view_box.height),
            format_number(view_box.min_x),
            format_number(view_box.min_y),
            format_number(view_box.width),
            format_number(view_box.height),
        ));
        out.push_str(&part.body);
        out.push_str("</svg>");
    }

    out.push_str("</svg>");
    Ok(out)
}

/// Deduplicate definitions. Identified definitions keep their first
/// occurrence; structural or anonymous ones are compared by normalized text.
fn merge_definitions<'a>(defs: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    let mut seen_ids = HashSet::new();
    let mut seen_content = HashSet::new();
    let mut merged = Vec::new();

    for def in defs {
        let (kind, id) = definition_head(def);
        let structural = STRUCTURAL_KINDS.contains(&kind.to_ascii_lowercase().as_str());
        let fresh = match id {
            Some(id) if !structural => seen_ids.insert(id.to_string()),
            _ => seen_content.insert(normalize_whitespace(def)),
        };
        if fresh {
            merged.push(def.as_str());
        }
    }
    merged
}

/// Tag name and `id` of a definition's opening tag.
fn definition_head(def: &str) -> (&str, Option<&str>) {
    let open = def
        .trim_start()
        .strip_prefix('<')
        .map(|rest| rest.split('>').next().unwrap_or(rest))
        .unwrap_or("");
    let kind = open
        .split(|c: char| c.is_whitespace() || c == '/')
        .next()
        .unwrap_or("");

    let id = [" id=\"", " id='"].iter().find_map(|prefix| {
        let start = open.find(prefix)? + prefix.len();
        let quote = prefix.chars().last()?;
        let end = open[start..].find(quote)?;
        Some(&open[start..start + end])
    });
    (kind, id)
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace("> <", "><")
}
