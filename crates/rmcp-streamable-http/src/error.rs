use std::fmt::Display;

use http::StatusCode;

use crate::{
    model::{EnvelopeError, ErrorCode, ErrorData, RequestId},
    transport::event_store::EventStoreError,
};

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Coarse classification of [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed JSON or JSON-RPC envelope
    Parse,
    /// Bad initialization sequence or protocol version
    Protocol,
    /// Missing, invalid or unknown session
    Session,
    /// Unacceptable `Accept` / `Content-Type` or HTTP method
    Negotiation,
    /// Outbound message that cannot be routed; a dispatcher bug
    Correlation,
    /// Event persistence or replay failure
    Store,
    Internal,
}

/// Every way handling a request or sending a message can fail.
///
/// Client-facing kinds are rendered as JSON-RPC error envelopes with an HTTP
/// status; correlation and store errors are reported through the transport's
/// error callback.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{0}")]
    Parse(#[from] EnvelopeError),

    #[error("Invalid Request: Server already initialized")]
    AlreadyInitialized,
    #[error("Invalid Request: Only one initialization request is allowed")]
    InitializeNotSolitary,
    #[error("Invalid Request: duplicate request id {0}")]
    DuplicateRequestId(RequestId),
    #[error("Bad Request: Unsupported protocol version {requested} (supported versions: {supported})")]
    UnsupportedProtocolVersion { requested: String, supported: String },

    #[error("Bad Request: Server not initialized")]
    NotInitialized,
    #[error("Bad Request: Mcp-Session-Id header is required")]
    MissingSessionId,
    #[error("Bad Request: Mcp-Session-Id header must be a single value")]
    InvalidSessionId,
    #[error("Session not found")]
    SessionNotFound,

    #[error("Not Acceptable: {0}")]
    NotAcceptable(&'static str),
    #[error("Unsupported Media Type: Content-Type must be application/json")]
    UnsupportedMediaType,
    #[error("Method not allowed.")]
    MethodNotAllowed,
    #[error("Conflict: Only one SSE stream is allowed per session")]
    Conflict,

    #[error("No connection established for request ID: {0}")]
    NoConnection(RequestId),
    #[error("Cannot send a response on a standalone SSE stream unless resuming a previous client request")]
    UnroutableResponse,

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Transport already started")]
    AlreadyStarted,
    #[error("Transport not started")]
    NotStarted,
    #[error("Session not found: transport closed")]
    Closed,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Parse(_) => ErrorKind::Parse,
            TransportError::AlreadyInitialized
            | TransportError::InitializeNotSolitary
            | TransportError::DuplicateRequestId(_)
            | TransportError::UnsupportedProtocolVersion { .. } => ErrorKind::Protocol,
            TransportError::NotInitialized
            | TransportError::MissingSessionId
            | TransportError::InvalidSessionId
            | TransportError::SessionNotFound
            | TransportError::Closed => ErrorKind::Session,
            TransportError::NotAcceptable(_)
            | TransportError::UnsupportedMediaType
            | TransportError::MethodNotAllowed
            | TransportError::Conflict => ErrorKind::Negotiation,
            TransportError::NoConnection(_) | TransportError::UnroutableResponse => {
                ErrorKind::Correlation
            }
            TransportError::EventStore(_) => ErrorKind::Store,
            TransportError::AlreadyStarted
            | TransportError::NotStarted
            | TransportError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            TransportError::Parse(_)
            | TransportError::AlreadyInitialized
            | TransportError::InitializeNotSolitary
            | TransportError::DuplicateRequestId(_)
            | TransportError::UnsupportedProtocolVersion { .. }
            | TransportError::NotInitialized
            | TransportError::MissingSessionId
            | TransportError::InvalidSessionId => StatusCode::BAD_REQUEST,
            TransportError::SessionNotFound | TransportError::Closed => StatusCode::NOT_FOUND,
            TransportError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            TransportError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TransportError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            TransportError::Conflict => StatusCode::CONFLICT,
            TransportError::NoConnection(_)
            | TransportError::UnroutableResponse
            | TransportError::EventStore(_)
            | TransportError::AlreadyStarted
            | TransportError::NotStarted
            | TransportError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransportError::Parse(EnvelopeError::EmptyBatch) => ErrorCode::INVALID_REQUEST,
            TransportError::Parse(_) => ErrorCode::PARSE_ERROR,
            TransportError::AlreadyInitialized
            | TransportError::InitializeNotSolitary
            | TransportError::DuplicateRequestId(_) => ErrorCode::INVALID_REQUEST,
            TransportError::SessionNotFound | TransportError::Closed => {
                ErrorCode::SESSION_NOT_FOUND
            }
            TransportError::UnsupportedProtocolVersion { .. }
            | TransportError::NotInitialized
            | TransportError::MissingSessionId
            | TransportError::InvalidSessionId
            | TransportError::NotAcceptable(_)
            | TransportError::UnsupportedMediaType
            | TransportError::MethodNotAllowed
            | TransportError::Conflict => ErrorCode::BAD_REQUEST,
            TransportError::NoConnection(_)
            | TransportError::UnroutableResponse
            | TransportError::EventStore(_)
            | TransportError::AlreadyStarted
            | TransportError::NotStarted
            | TransportError::Internal(_) => ErrorCode::INTERNAL_ERROR,
        }
    }

    /// The JSON-RPC error payload sent to the client.
    ///
    /// Server-side failures never leak their details.
    pub fn to_error_data(&self) -> ErrorData {
        let message = match self.kind() {
            ErrorKind::Correlation | ErrorKind::Store | ErrorKind::Internal => {
                "Internal error".to_string()
            }
            _ => self.to_string(),
        };
        ErrorData::new(self.error_code(), message, None)
    }

    pub fn is_client_facing(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Parse | ErrorKind::Protocol | ErrorKind::Session | ErrorKind::Negotiation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_data_display_without_data() {
        let error = ErrorData {
            code: ErrorCode(-32600),
            message: "Invalid Request".into(),
            data: None,
        };
        assert_eq!(format!("{}", error), "-32600: Invalid Request");
    }

    #[test]
    fn test_error_data_display_with_data() {
        let error = ErrorData {
            code: ErrorCode(-32600),
            message: "Invalid Request".into(),
            data: Some(serde_json::json!({"detail": "missing field"})),
        };
        assert_eq!(
            format!("{}", error),
            "-32600: Invalid Request({\"detail\":\"missing field\"})"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TransportError::SessionNotFound.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TransportError::Conflict.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            TransportError::NotAcceptable("x").status_code(),
            StatusCode::NOT_ACCEPTABLE
        );
        assert_eq!(
            TransportError::UnsupportedMediaType.status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            TransportError::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            TransportError::AlreadyInitialized.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TransportError::Parse(EnvelopeError::EmptyBatch).error_code(),
            ErrorCode::INVALID_REQUEST
        );
        assert_eq!(
            TransportError::SessionNotFound.error_code(),
            ErrorCode::SESSION_NOT_FOUND
        );
        assert_eq!(
            TransportError::MissingSessionId.error_code(),
            ErrorCode::BAD_REQUEST
        );
        assert_eq!(
            TransportError::InitializeNotSolitary.error_code(),
            ErrorCode::INVALID_REQUEST
        );
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let error = TransportError::Internal("database password is hunter2".into());
        let data = error.to_error_data();
        assert_eq!(data.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(data.message, "Internal error");
        assert!(!error.is_client_facing());

        let error = TransportError::NoConnection(RequestId::Number(3));
        assert_eq!(error.kind(), ErrorKind::Correlation);
        assert_eq!(error.to_error_data().message, "Internal error");
    }

    #[test]
    fn test_already_initialized_message() {
        let data = TransportError::AlreadyInitialized.to_error_data();
        assert!(data.message.contains("already initialized"));
        assert!(TransportError::AlreadyInitialized.is_client_facing());
    }
}
