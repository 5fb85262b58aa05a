use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid fingerprint `{value}`: {reason}")]
    InvalidFingerprint { value: String, reason: String },
}

impl DomainError {
    pub fn invalid_fingerprint(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFingerprint {
            value: value.into(),
            reason: reason.into(),
        }
    }
}
