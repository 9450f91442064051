use std::sync::Arc;

use async_graphql::{Error, ErrorExtensions};
use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Shared service result type.
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error, Clone)]
pub enum ApiError {
    #[error("login required")]
    Unauthenticated,
    #[error("insufficient permissions")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    /// Store or transport failure. Callers may retry.
    #[error("storage temporarily unavailable")]
    Unavailable(Arc<anyhow::Error>),
    #[error("internal server error")]
    Internal(Arc<anyhow::Error>),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "UNAUTHENTICATED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Validation(_) => "VALIDATION",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Unavailable(_) => "UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Unavailable(_) | ApiError::Conflict(_))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self::Internal(Arc::new(err))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(value)
    }
}

impl From<DbErr> for ApiError {
    fn from(value: DbErr) -> Self {
        if let Some(SqlErr::UniqueConstraintViolation(detail)) = value.sql_err() {
            return Self::Conflict(format!("duplicate record: {}", detail));
        }
        tracing::error!(error = %value, "store failure");
        Self::Unavailable(Arc::new(anyhow::Error::new(value)))
    }
}

impl ErrorExtensions for ApiError {
    fn extend(&self) -> Error {
        let mut err = Error::new(self.to_string());
        err = err.extend_with(|_err, e| {
            e.set("code", self.code());
        });
        if self.is_retryable() {
            err = err.extend_with(|_err, e| {
                e.set("retryable", true);
            });
        }
        err
    }
}

/// Convert a service error into a GraphQL error carrying its code.
pub fn gql_error(err: ApiError) -> Error {
    err.extend()
}

/// Convert any error into a GraphQL error payload while hiding internals.
pub fn internal_error(err: impl Into<anyhow::Error>) -> Error {
    ApiError::internal(err.into()).extend()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_graphql::Value;

    fn code_of(err: &Error) -> Option<Value> {
        err.extensions
            .as_ref()
            .and_then(|map| map.get("code"))
            .cloned()
    }

    #[test]
    fn internal_errors_are_masked() {
        let err = internal_error(anyhow::anyhow!("boom"));
        assert_eq!(err.message, "internal server error");
        assert_eq!(code_of(&err), Some(Value::from("INTERNAL")));
    }

    #[test]
    fn store_failures_are_retryable_and_masked() {
        let err: ApiError = DbErr::Custom("connection reset".into()).into();
        assert_eq!(err.code(), "UNAVAILABLE");
        assert!(err.is_retryable());
        let gql = gql_error(err);
        assert!(!gql.message.contains("connection reset"));
        let retryable = gql
            .extensions
            .as_ref()
            .and_then(|map| map.get("retryable"))
            .cloned();
        assert_eq!(retryable, Some(Value::from(true)));
    }

    #[test]
    fn validation_messages_reach_the_caller() {
        let gql = gql_error(ApiError::validation("stage must be between 1 and 5"));
        assert_eq!(gql.message, "stage must be between 1 and 5");
        assert_eq!(code_of(&gql), Some(Value::from("VALIDATION")));
    }

    #[test]
    fn not_found_names_the_resource() {
        let err = ApiError::not_found("order");
        assert_eq!(err.to_string(), "order not found");
        assert!(!err.is_retryable());
    }
}
