use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

pub type Result<T> = std::result::Result<T, EndpointError>;

/// What a failed endpoint hands back: a coarse category the client can
/// branch on, plus a message saying what actually went wrong.
#[derive(serde::Serialize, PartialEq, Eq, Debug)]
pub struct EndpointError {
    kind: ErrorKind,
    message: String,
}

#[derive(serde::Serialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request itself is at fault: bad payload, unusable file format
    User,
    NotFound,
    /// An embedding or LLM provider let us down
    UpstreamService,
    Internal,
}

impl EndpointError {
    pub fn user(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::User,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::UpstreamService,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::User => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::UpstreamService => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EndpointError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<crate::db::DbError> for EndpointError {
    fn from(error: crate::db::DbError) -> Self {
        match &error {
            crate::db::DbError::NotFound { .. } => EndpointError::not_found(error.to_string()),
            crate::db::DbError::NameTaken(_) => EndpointError::user(error.to_string()),
            _ => EndpointError::internal(error.to_string()),
        }
    }
}

impl From<crate::kb::ingest::IngestError> for EndpointError {
    fn from(error: crate::kb::ingest::IngestError) -> Self {
        use crate::kb::ingest::IngestError;
        match &error {
            IngestError::UnsupportedFormat(_) | IngestError::EmptyDocument(_) => {
                EndpointError::user(error.to_string())
            }
            IngestError::KbNotFound(_) | IngestError::DocumentNotFound(_) => {
                EndpointError::not_found(error.to_string())
            }
            IngestError::Embedding(_) => EndpointError::upstream(error.to_string()),
            _ => EndpointError::internal(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_map_to_statuses() {
        assert_eq!(EndpointError::user("bad").status(), StatusCode::BAD_REQUEST);
        assert_eq!(EndpointError::not_found("gone").status(), StatusCode::NOT_FOUND);
        assert_eq!(EndpointError::upstream("down").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            EndpointError::internal("broken").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_ingest_errors_pick_sensible_kinds() {
        use crate::kb::ingest::IngestError;

        let unsupported: EndpointError = IngestError::UnsupportedFormat("docx".into()).into();
        assert_eq!(unsupported.status(), StatusCode::BAD_REQUEST);

        let missing: EndpointError = IngestError::DocumentNotFound("d1".into()).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
