//! Errors that end a pipeline operation.
//!
//! Everything recoverable is handled inside the components (see
//! [`Outcome`](crate::outcome::Outcome) and the empty-result paths of the
//! retriever and index manager). What reaches this type is fatal for the
//! document or question at hand; the orchestration layer marks the document
//! `error` and shows the message to the user.

use thiserror::Error;

use crate::rasterize::RasterizeError;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A client could not be built because its API key is absent.
    #[error("{component} is not configured: missing {env_var}")]
    MissingCredentials {
        component: &'static str,
        env_var: &'static str,
    },

    #[error(transparent)]
    Rasterize(#[from] RasterizeError),

    #[error("no content extracted from the document")]
    NoContentExtracted,

    #[error("could not prepare vector collection {0}")]
    Collection(String),

    #[error("indexing failed: {0}")]
    Indexing(String),

    #[error("answer generation failed: {0}")]
    Generation(String),

    #[error("internal task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Short machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::MissingCredentials { .. } => "missing_credentials",
            PipelineError::Rasterize(RasterizeError::UnsupportedInput(_)) => "unsupported_input",
            PipelineError::Rasterize(_) => "rasterize_failed",
            PipelineError::NoContentExtracted => "no_content",
            PipelineError::Collection(_) | PipelineError::Indexing(_) => "indexing_failed",
            PipelineError::Generation(_) => "generation_failed",
            PipelineError::Task(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_names_the_variable() {
        let err = PipelineError::MissingCredentials {
            component: "vision model",
            env_var: "ANTHROPIC_API_KEY",
        };
        assert_eq!(
            err.to_string(),
            "vision model is not configured: missing ANTHROPIC_API_KEY"
        );
        assert_eq!(err.code(), "missing_credentials");
    }

    #[test]
    fn unsupported_input_has_its_own_code() {
        let err: PipelineError = RasterizeError::UnsupportedInput("notes.odt".into()).into();
        assert_eq!(err.code(), "unsupported_input");
    }
}
