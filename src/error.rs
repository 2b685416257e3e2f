//! # Error Handling
//!
//! Unified error taxonomy for the collector. Every component returns
//! [`CollectorError`] so callers (the reconciler, repeater callbacks and the
//! queue flush path) can log and classify failures uniformly.

use thiserror::Error;

/// Maximum number of characters of an upstream response body kept in errors.
const BODY_SNIPPET_CHARS: usize = 200;

/// Collector-wide error type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollectorError {
    /// Structurally invalid arguments supplied to the evaluator or validators.
    #[error("ArgsError: {0}")]
    Args(String),
    /// A value failed a domain invariant.
    #[error("ValidationError: {0}")]
    Validation(String),
    /// User-authored code failed to parse, threw, touched a forbidden
    /// capability or ran past its time budget.
    #[error("FunctionBodyError: {name}: {message}")]
    FunctionBody { name: String, message: String },
    /// A transform returned something other than an array of samples.
    #[error("TransformError: {0}")]
    Transform(String),
    /// A URL-building function returned something other than a string.
    #[error("ToUrlError: {0}")]
    ToUrl(String),
    /// A required local resource (for example a configuration file) is missing.
    #[error("ResourceNotFoundError: {0}")]
    ResourceNotFound(String),
    /// Non-success HTTP response from the control plane or a data source.
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },
    /// Transport-level failure.
    #[error("Network error: {0}")]
    Network(String),
    /// A spawned task panicked or was cancelled.
    #[error("Task error: {0}")]
    Task(String),
}

impl CollectorError {
    pub fn args<S: Into<String>>(message: S) -> Self {
        Self::Args(message.into())
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn function_body<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self::FunctionBody {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn transform<S: Into<String>>(message: S) -> Self {
        Self::Transform(message.into())
    }

    pub fn to_url<S: Into<String>>(message: S) -> Self {
        Self::ToUrl(message.into())
    }

    pub fn resource_not_found<S: Into<String>>(message: S) -> Self {
        Self::ResourceNotFound(message.into())
    }

    /// Build an HTTP error, truncating the body snippet.
    pub fn http(status: u16, body: &str) -> Self {
        Self::Http {
            status,
            body: truncate_body(body),
        }
    }

    /// Kind name as reported to operators and in error samples.
    pub fn name(&self) -> &'static str {
        match self {
            CollectorError::Args(_) => "ArgsError",
            CollectorError::Validation(_) => "ValidationError",
            CollectorError::FunctionBody { .. } => "FunctionBodyError",
            CollectorError::Transform(_) => "TransformError",
            CollectorError::ToUrl(_) => "ToUrlError",
            CollectorError::ResourceNotFound(_) => "ResourceNotFoundError",
            CollectorError::Http { .. } => "HttpError",
            CollectorError::Network(_) => "NetworkError",
            CollectorError::Task(_) => "TaskError",
        }
    }

    /// Errors caused by user-authored template code.
    pub fn is_template_error(&self) -> bool {
        matches!(
            self,
            CollectorError::FunctionBody { .. }
                | CollectorError::Transform(_)
                | CollectorError::ToUrl(_)
        )
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return CollectorError::http(status.as_u16(), &error.to_string());
        }
        CollectorError::Network(error.to_string())
    }
}

impl From<tokio::task::JoinError> for CollectorError {
    fn from(error: tokio::task::JoinError) -> Self {
        if error.is_panic() {
            CollectorError::Task("task panicked".to_string())
        } else {
            CollectorError::Task("task was cancelled".to_string())
        }
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() > BODY_SNIPPET_CHARS {
        let truncated: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}
