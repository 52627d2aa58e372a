use thiserror::Error;

use crate::store::StoreError;

/// Every failure a request handler can end in.
///
/// Client errors carry their message to the response body. Server-side
/// failures are logged and answered with a generic message.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[cfg(feature = "web")]
    #[error("Mail error: {0}")]
    Mail(#[from] crate::mailer::MailError),

    #[cfg(feature = "web")]
    #[error("Template error: {0}")]
    Template(#[from] crate::templates::TemplateError),

    #[cfg(feature = "web")]
    #[error("Object storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[cfg(feature = "web")]
    #[error("ID card error: {0}")]
    IdCard(#[from] crate::idcard::IdCardError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { collection, id } => {
                AppError::NotFound(format!("{id} not found in {collection}"))
            }
            StoreError::Conflict(message) => AppError::Conflict(message),
            other => AppError::Store(other),
        }
    }
}

#[cfg(feature = "web")]
mod response {
    use axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    };
    use serde_json::json;
    use tracing::error;

    use super::AppError;

    impl AppError {
        pub fn status(&self) -> StatusCode {
            match self {
                AppError::Unauthorized => StatusCode::UNAUTHORIZED,
                AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
                AppError::NotFound(_) => StatusCode::NOT_FOUND,
                AppError::Conflict(_) => StatusCode::CONFLICT,
                // Unparseable templates are the caller's input
                AppError::Template(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        }
    }

    impl IntoResponse for AppError {
        fn into_response(self) -> Response {
            let status = self.status();

            let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!(error = %self, "request failed");
                "Internal server error".to_string()
            } else {
                self.to_string()
            };

            (status, Json(json!({ "success": false, "error": message }))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_client_errors() {
        let not_found: AppError = StoreError::NotFound {
            collection: "participants",
            id: "p1".to_string(),
        }
        .into();
        assert!(matches!(not_found, AppError::NotFound(_)));

        let conflict: AppError = StoreError::Conflict("taken".to_string()).into();
        assert!(matches!(conflict, AppError::Conflict(ref m) if m == "taken"));

        let io: AppError = StoreError::Io(std::io::Error::other("disk")).into();
        assert!(matches!(io, AppError::Store(_)));
    }
}
