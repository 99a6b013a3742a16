use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::error::FormulaError;
use crate::domain::formula::FormulaInput;
use crate::domain::options::{EngineOptions, SpeechEngineKind, SpeechOptions};

/// Internal coordinate rectangle of a vector fragment (`viewBox`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewBox {
    pub min_x: f64,
    pub min_y: f64,
    pub width: f64,
    pub height: f64,
}

impl ViewBox {
    pub fn max_y(&self) -> f64 {
        self.min_y + self.height
    }
}

/// Declared size of a fragment in ex units plus its coordinate space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FragmentMetrics {
    /// Declared display width in ex.
    pub width_ex: f64,
    /// Declared display height in ex.
    pub height_ex: f64,
    /// Baseline offset from the `vertical-align` style, in ex. Zero when absent.
    pub vertical_align_ex: f64,
    pub view_box: ViewBox,
}

impl FragmentMetrics {
    /// Coordinate units per ex. Defaults to 1 for zero-width fragments.
    pub fn scale(&self) -> f64 {
        if self.width_ex > 0.0 && self.view_box.width > 0.0 {
            self.view_box.width / self.width_ex
        } else {
            1.0
        }
    }
}

/// One rendered vector fragment, as emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Complete `<svg>` document for this fragment.
    pub svg: String,
    pub metrics: FragmentMetrics,
}

/// Output size requested from the raster converter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterTarget {
    /// Target pixel width; derived from `dpi` when absent.
    pub width: Option<u32>,
    pub dpi: u32,
    /// Pixel size of one ex, used to resolve ex-based document sizes.
    pub ex_px: f64,
    /// Largest accepted output dimension in pixels.
    pub max_dimension: u32,
}

/// Failures reported by external engines and converters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("engine failed to start: {message}")]
    Startup { message: String },
    #[error("{message}")]
    Render { message: String },
    #[error("{what} is not supported by this engine")]
    Unsupported { what: String },
    #[error("engine protocol violation: {message}")]
    Protocol { message: String },
    /// The engine process closed its pipes and cannot answer again.
    #[error("engine process is gone: {message}")]
    Disconnected { message: String },
    #[error("{name} is not available")]
    Unavailable { name: String },
}

impl EngineError {
    pub fn startup(message: impl Into<String>) -> Self {
        Self::Startup {
            message: message.into(),
        }
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render {
            message: message.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported { what: what.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Disconnected {
            message: message.into(),
        }
    }

    pub fn unavailable(name: impl Into<String>) -> Self {
        Self::Unavailable { name: name.into() }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

impl From<EngineError> for FormulaError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Startup { message } => FormulaError::engine_initialization(message),
            EngineError::Render { .. } | EngineError::Unsupported { .. } => {
                FormulaError::conversion(error.to_string())
            }
            EngineError::Unavailable { .. } => FormulaError::option(error.to_string()),
            EngineError::Protocol { .. } | EngineError::Disconnected { .. } => {
                FormulaError::unexpected(error.to_string())
            }
        }
    }
}

/// Shared, non-reentrant formula rendering engine.
///
/// Callers serialize access through the engine lock; implementations may
/// assume at most one call is in flight, except for calls whose caller has
/// already given up after a deadline.
#[async_trait]
pub trait MathEngine: Send + Sync {
    /// Resolves once the engine can accept work. Must be awaited after construction.
    async fn ready(&self) -> Result<(), EngineError>;

    /// Render `input` to one or more vector fragments, in emission order.
    async fn render_svg(
        &self,
        input: &FormulaInput,
        options: &EngineOptions,
    ) -> Result<Vec<Fragment>, EngineError>;

    /// Convert `input` to MathML for the speech engines.
    async fn to_mathml(&self, input: &FormulaInput) -> Result<String, EngineError>;

    /// Release external resources. The instance is not used afterwards.
    async fn shutdown(&self);
}

/// Builds engines loaded with a given capability list.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, capabilities: &[String]) -> Result<Arc<dyn MathEngine>, EngineError>;
}

/// Accessibility speech generator.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    fn kind(&self) -> SpeechEngineKind;

    async fn speak(&self, mathml: &str, options: &SpeechOptions) -> Result<String, EngineError>;
}

/// Vector to raster conversion. Synchronous and CPU-bound.
pub trait RasterConverter: Send + Sync {
    fn rasterize(&self, svg: &str, target: &RasterTarget) -> Result<Vec<u8>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(width_ex: f64, vb_width: f64) -> FragmentMetrics {
        FragmentMetrics {
            width_ex,
            height_ex: 2.0,
            vertical_align_ex: 0.0,
            view_box: ViewBox {
                min_x: 0.0,
                min_y: -750.0,
                width: vb_width,
                height: 1000.0,
            },
        }
    }

    #[test]
    fn scale_is_view_units_per_ex() {
        assert_eq!(metrics(4.0, 2000.0).scale(), 500.0);
    }

    #[test]
    fn zero_width_scale_defaults_to_one() {
        assert_eq!(metrics(0.0, 2000.0).scale(), 1.0);
        assert_eq!(metrics(4.0, 0.0).scale(), 1.0);
    }

    #[test]
    fn engine_errors_map_to_taxonomy() {
        assert!(matches!(
            FormulaError::from(EngineError::startup("boom")),
            FormulaError::EngineInitialization { .. }
        ));
        assert!(matches!(
            FormulaError::from(EngineError::render("Undefined control sequence")),
            FormulaError::Conversion { .. }
        ));
        assert!(matches!(
            FormulaError::from(EngineError::protocol("bad json")),
            FormulaError::Unexpected { .. }
        ));
        assert!(matches!(
            FormulaError::from(EngineError::disconnected("broken pipe")),
            FormulaError::Unexpected { .. }
        ));
    }
}
