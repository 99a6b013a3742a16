use std::fmt;

use thiserror::Error;

/// Processing stage that exceeded its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    EngineReady,
    Engine,
    Raster,
    Speech,
}

impl ProcessingStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStage::EngineReady => "engine startup",
            ProcessingStage::Engine => "engine",
            ProcessingStage::Raster => "raster conversion",
            ProcessingStage::Speech => "speech generation",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a formula request can fail.
///
/// Validation errors are raised before any lock is taken. Timeout and
/// conversion errors are raised after locks were released. Initialization
/// errors leave the shared engine unusable until it is rebuilt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FormulaError {
    #[error("{message}")]
    InputValidation { message: String },
    #[error("{message}")]
    OptionValidation { message: String },
    #[error("{stage} timed out after {timeout_ms} ms")]
    EngineTimeout {
        stage: ProcessingStage,
        timeout_ms: u64,
    },
    #[error("engine initialization failed: {message}")]
    EngineInitialization { message: String },
    #[error("conversion failed: {message}")]
    Conversion { message: String },
    #[error("unexpected error: {message}")]
    Unexpected { message: String },
}

impl FormulaError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::InputValidation {
            message: message.into(),
        }
    }

    pub fn option(message: impl Into<String>) -> Self {
        Self::OptionValidation {
            message: message.into(),
        }
    }

    pub fn timeout(stage: ProcessingStage, timeout_ms: u64) -> Self {
        Self::EngineTimeout { stage, timeout_ms }
    }

    pub fn engine_initialization(message: impl Into<String>) -> Self {
        Self::EngineInitialization {
            message: message.into(),
        }
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Stable machine-readable identifier used in structured error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FormulaError::InputValidation { .. } => "input_validation",
            FormulaError::OptionValidation { .. } => "option_validation",
            FormulaError::EngineTimeout { .. } => "engine_timeout",
            FormulaError::EngineInitialization { .. } => "engine_initialization",
            FormulaError::Conversion { .. } => "conversion",
            FormulaError::Unexpected { .. } => "unexpected",
        }
    }

    /// True for errors detected before any shared resource was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FormulaError::InputValidation { .. } | FormulaError::OptionValidation { .. }
        )
    }
}
