//! One error type at the HTTP boundary.
//!
//! Every service error converts into an [`ApiError`] carrying a stable
//! kind string and its status code: NotFound→404, Invalid→400/422,
//! Conflict→409, Unauthorized→401, Forbidden→403, RateLimited→429,
//! transient exhaustion→500. Queue-specific conditions keep their own
//! kinds so clients can branch without parsing prose.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use orq_db::StoreError;
use orq_dispatch::DispatchError;
use orq_events::EventStoreError;
use orq_queue::QueueError;
use orq_tasks::ChainError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    kind: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "unauthorized")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: &self.message,
                kind: self.kind,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", e.to_string()),
            StoreError::Conflict(_) => Self::new(StatusCode::CONFLICT, "conflict", e.to_string()),
            StoreError::Immutable(_) => {
                Self::new(StatusCode::CONFLICT, "immutable", e.to_string())
            }
            StoreError::Invalid { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid", e.to_string())
            }
            StoreError::Db(_) => Self::internal(e.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match &e {
            QueueError::NoJob => Self::new(StatusCode::NOT_FOUND, "no_job", e.to_string()),
            QueueError::NotFound => Self::new(StatusCode::NOT_FOUND, "not_found", e.to_string()),
            QueueError::LeaseStolen { .. } => {
                Self::new(StatusCode::CONFLICT, "lease_stolen", e.to_string())
            }
            QueueError::AlreadyExists => {
                Self::new(StatusCode::CONFLICT, "conflict", e.to_string())
            }
            QueueError::Invalid { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid", e.to_string())
            }
            QueueError::Db(_) => Self::internal(e.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Unauthorized => Self::unauthorized(),
            DispatchError::Queue(q) => q.into(),
        }
    }
}

impl From<EventStoreError> for ApiError {
    fn from(e: EventStoreError) -> Self {
        match &e {
            EventStoreError::EventTypeRequired
            | EventStoreError::InvalidRange { .. }
            | EventStoreError::InvalidPartitionKey(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid", e.to_string())
            }
            EventStoreError::AlreadyExists => {
                Self::new(StatusCode::CONFLICT, "conflict", e.to_string())
            }
            EventStoreError::Db(_) => Self::internal(e.to_string()),
        }
    }
}

impl From<ChainError> for ApiError {
    fn from(e: ChainError) -> Self {
        match &e {
            ChainError::Validation(_) | ChainError::UnknownHook(_) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid", e.to_string())
            }
            ChainError::NoTransition { .. }
            | ChainError::Aborted { .. }
            | ChainError::StepBudgetExceeded { .. } => Self::internal(format!("{e:#}")),
        }
    }
}

impl From<orq_resolver::ResolveError> for ApiError {
    fn from(e: orq_resolver::ResolveError) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "no_satisfying_model",
            e.to_string(),
        )
    }
}
