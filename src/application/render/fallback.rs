//! Content-type-matched error artifacts.

/// Smallest valid PNG (1×1, transparent). Used when even the placeholder cannot be rasterized.
pub const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

const CHAR_WIDTH_PX: usize = 7;
const PADDING_PX: usize = 8;
const HEIGHT_PX: usize = 24;

/// Cut `message` to at most `max_chars` characters, marking the cut.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    let message = message.trim();
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut truncated: String = message.chars().take(keep).collect();
    truncated.push_str("...");
    truncated
}

/// Small captioned placeholder graphic carrying `message`.
pub fn placeholder_svg(message: &str) -> String {
    let width = message.chars().count().max(1) * CHAR_WIDTH_PX + 2 * PADDING_PX;
    format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
            r##"<rect x="0.5" y="0.5" width="{rw}" height="{rh}" fill="#fff4f4" stroke="#b00020"/>"##,
            r##"<text x="{pad}" y="16" font-family="monospace" font-size="12" fill="#b00020">{text}</text>"##,
            "</svg>"
        ),
        w = width,
        h = HEIGHT_PX,
        rw = width - 1,
        rh = HEIGHT_PX - 1,
        pad = PADDING_PX,
        text = escape_xml(message),
    )
}

/// Plain-text speech fallback line.
pub fn speech_text(message: &str) -> String {
    format!("Error: {message}")
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c if c.is_control() => escaped.push(' '),
            c => escaped.push(c),
        }
    }
    escaped
}
