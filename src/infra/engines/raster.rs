use std::sync::Arc;

use once_cell::sync::Lazy;
use resvg::tiny_skia::{Pixmap, Transform};
use resvg::usvg::{self, fontdb};

use crate::application::render::{EngineError, RasterConverter, RasterTarget};

/// CSS reference resolution.
const CSS_DPI: f32 = 96.0;

static SYSTEM_FONTS: Lazy<Arc<fontdb::Database>> = Lazy::new(|| {
    let mut database = fontdb::Database::new();
    database.load_system_fonts();
    Arc::new(database)
});

/// SVG to PNG through `resvg`.
#[derive(Clone)]
pub struct ResvgRasterizer {
    fonts: Arc<fontdb::Database>,
}

impl Default for ResvgRasterizer {
    fn default() -> Self {
        Self {
            fonts: Arc::clone(&SYSTEM_FONTS),
        }
    }
}

impl ResvgRasterizer {
    /// Rasterizer without system fonts. Text elements are skipped.
    pub fn without_fonts() -> Self {
        Self {
            fonts: Arc::new(fontdb::Database::new()),
        }
    }
}

impl RasterConverter for ResvgRasterizer {
    fn rasterize(&self, svg: &str, target: &RasterTarget) -> Result<Vec<u8>, EngineError> {
        let mut options = usvg::Options::default();
        // `ex` lengths resolve to half the font size.
        options.font_size = (target.ex_px * 2.0) as f32;
        options.fontdb = Arc::clone(&self.fonts);

        let tree = usvg::Tree::from_str(svg, &options)
            .map_err(|err| EngineError::render(format!("failed to parse SVG: {err}")))?;

        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            return Err(EngineError::render("SVG has an empty canvas"));
        }

        let scale = match target.width {
            Some(width) => width as f32 / size.width(),
            None => target.dpi as f32 / CSS_DPI,
        };
        let width = (size.width() * scale).ceil().max(1.0) as u32;
        let height = (size.height() * scale).ceil().max(1.0) as u32;
        if width > target.max_dimension || height > target.max_dimension {
            return Err(EngineError::render(format!(
                "raster size {width}x{height} exceeds the {} pixel limit",
                target.max_dimension
            )));
        }

        let mut pixmap = Pixmap::new(width, height).ok_or_else(|| {
            EngineError::render(format!("failed to allocate a {width}x{height} canvas"))
        })?;
        resvg::render(&tree, Transform::from_scale(scale, scale), &mut pixmap.as_mut());

        pixmap
            .encode_png()
            .map_err(|err| EngineError::render(format!("failed to encode PNG: {err}")))
    }
}
