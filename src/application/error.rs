use thiserror::Error;

use crate::{
    application::repos::RepoError, config::LoadError, domain::error::DomainError,
    infra::error::InfraError, matching::MatchError,
};

/// Failures of a match, learn or reinforce call.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] RepoError),
    #[error(transparent)]
    Matching(#[from] MatchError),
    #[error("fingerprint worker failed: {message}")]
    Worker { message: String },
}

/// Top-level error of the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code: 2 for bad input or configuration, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_)
            | AppError::Validation(_)
            | AppError::Domain(_)
            | AppError::Infra(InfraError::Configuration { .. })
            | AppError::Engine(EngineError::Storage(RepoError::InvalidInput { .. })) => 2,
            _ => 1,
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        Self::Engine(EngineError::Storage(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_exit_with_two() {
        assert_eq!(AppError::validation("empty text").exit_code(), 2);
        assert_eq!(
            AppError::from(RepoError::invalid_input("bad resolution")).exit_code(),
            2
        );
        assert_eq!(AppError::from(RepoError::Timeout).exit_code(), 1);
        assert_eq!(
            AppError::from(EngineError::from(MatchError::MissingThreshold { resolution: 96 }))
                .exit_code(),
            1
        );
    }
}
