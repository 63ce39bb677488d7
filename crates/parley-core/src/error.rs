use crate::e2ee::CryptoError;
use parley_util::validation::ValidationError;
use thiserror::Error;

/// Stable error categories shared by the gateway and the REST layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Authorization,
    NotFound,
    Validation,
    Conflict,
    Transient,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("authentication failed")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] parley_db::DbError),
    #[error("encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated => ErrorKind::Authentication,
            Self::Forbidden(_) => ErrorKind::Authorization,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Crypto(err) => err.kind(),
            Self::Database(parley_db::DbError::NotFound) => ErrorKind::NotFound,
            Self::Database(_) | Self::Internal(_) => ErrorKind::Transient,
        }
    }

    /// Message safe to show a client. Infrastructure details stay in the logs.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Transient => "temporary server error, please retry".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<ValidationError> for CoreError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_the_taxonomy() {
        assert_eq!(CoreError::Unauthenticated.kind().as_str(), "authentication");
        assert_eq!(CoreError::forbidden("x").kind().as_str(), "authorization");
        assert_eq!(CoreError::NotFound("room").kind().as_str(), "not_found");
        assert_eq!(CoreError::validation("x").kind().as_str(), "validation");
        assert_eq!(CoreError::conflict("x").kind().as_str(), "conflict");
        assert_eq!(CoreError::Internal("db down".into()).kind().as_str(), "transient");
    }

    #[test]
    fn transient_errors_hide_details() {
        let err = CoreError::Internal("connection reset by peer".into());
        assert!(!err.public_message().contains("peer"));
        assert_eq!(CoreError::NotFound("message").public_message(), "message not found");
    }

    #[test]
    fn session_lookup_failures_are_not_found() {
        let err = CoreError::from(CryptoError::SessionNotFound { from: 1, to: 2 });
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
