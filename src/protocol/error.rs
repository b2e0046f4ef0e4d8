use thiserror::Error;

use super::{response::ErrorBody, transport::TransportError};
use crate::{engine::EngineError, value::ValueError};

/// Violations that end the whole session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error("expected a hello message before anything else")]
    HelloExpected,

    #[error("hello message can only be sent once")]
    RepeatedHello,

    #[error("request id {0} is already pending")]
    DuplicateRequestId(u64),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures reported to the client for a single request; the session stays open.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("stream {stream_id} already exists")]
    StreamExists { stream_id: u64 },

    #[error("stream {stream_id} not found")]
    StreamNotFound { stream_id: u64 },

    #[error("stream {stream_id} has failed to open")]
    StreamNotOpen { stream_id: u64 },

    #[error("sql text {sql_id} already exists")]
    SqlExists { sql_id: u64 },

    #[error("sql text {sql_id} not found")]
    SqlNotFound { sql_id: u64 },

    #[error("invalid value: {0}")]
    ValueEncoding(#[from] ValueError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    StatementExecution(EngineError),

    #[error("stream {stream_id} could not connect: {source}")]
    ConnectionFailed { stream_id: u64, source: EngineError },

    #[error("stream {stream_id} could not be released: {source}")]
    ResourceRelease { stream_id: u64, source: EngineError },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ResponseError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::StreamExists { .. } => "STREAM_EXISTS",
            Self::StreamNotFound { .. } => "STREAM_NOT_FOUND",
            Self::StreamNotOpen { .. } => "STREAM_NOT_OPEN",
            Self::SqlExists { .. } => "SQL_EXISTS",
            Self::SqlNotFound { .. } => "SQL_NOT_FOUND",
            Self::ValueEncoding(_) => "VALUE_ENCODING_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::StatementExecution(_) => "SQL_EXECUTION_ERROR",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::ResourceRelease { .. } => "RESOURCE_RELEASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            message: self.to_string(),
            code: self.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_errors_carry_engine_message() {
        let err = ResponseError::StatementExecution(EngineError::Statement(
            "near \"SELEC\": syntax error".into(),
        ));
        let body = err.to_body();
        assert_eq!(body.code, "SQL_EXECUTION_ERROR");
        assert_eq!(body.message, "near \"SELEC\": syntax error");
    }

    #[test]
    fn value_errors_map_to_encoding_code() {
        let err: ResponseError = ValueError::UnprefixedName("a".into()).into();
        assert_eq!(err.code(), "VALUE_ENCODING_ERROR");
        assert!(err.to_string().contains("'a'"));
    }
}
