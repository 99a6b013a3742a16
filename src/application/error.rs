use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{domain::error::FormulaError, infra::error::InfraError};

/// Diagnostic attached to a response for the logging middleware.
///
/// Its presence also marks the response as a fallback: the response cache
/// never stores a response that carries one.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        let report = ErrorReport::from_message(source, status, detail);
        Self {
            status,
            public_message,
            report,
        }
    }

    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

/// Status used when failures are reported as structured errors.
pub fn formula_error_status(error: &FormulaError) -> StatusCode {
    match error {
        FormulaError::InputValidation { .. } | FormulaError::OptionValidation { .. } => {
            StatusCode::BAD_REQUEST
        }
        FormulaError::EngineTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        FormulaError::EngineInitialization { .. } => StatusCode::SERVICE_UNAVAILABLE,
        FormulaError::Conversion { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        FormulaError::Unexpected { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Failures outside a single formula request (startup, CLI rendering).
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Formula(error) => formula_error_status(error),
            AppError::Infra(_) | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Formula(error) if error.is_validation() => "Request could not be processed",
            AppError::Formula(FormulaError::EngineInitialization { .. }) => {
                "Service temporarily unavailable"
            }
            AppError::Formula(_) => "Formula could not be rendered",
            AppError::Infra(InfraError::Configuration { .. }) => "Service misconfigured",
            AppError::Infra(_) | AppError::Unexpected(_) => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}
