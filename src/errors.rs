use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::repositories::StoreError;

/// Standard error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Unprocessable Entity")
    pub error: String,
    /// Machine-readable checkout error code, when the failure is a business rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<CheckoutErrorCode>,
    /// Human-readable error description
    pub message: String,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

/// Machine-readable codes attached to checkout rejections.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutErrorCode {
    InvalidLocation,
    CookLocationInvalid,
    CityMismatch,
    DistanceExceeded,
    CouponNotFound,
    CampaignInactive,
    CouponAlreadyRedeemed,
    CouponScopeMismatch,
    MinOrderNotMet,
    AddressRequired,
    InvalidAddress,
    PaymentNotCompleted,
    SessionExpired,
    SessionClosed,
    PriceChanged,
    EmptyCart,
    InvalidCart,
    PaymentMethodLocked,
    IdempotencyKeyInUse,
}

impl CheckoutErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PaymentNotCompleted => StatusCode::PAYMENT_REQUIRED,
            Self::SessionExpired => StatusCode::GONE,
            Self::SessionClosed
            | Self::PriceChanged
            | Self::PaymentMethodLocked
            | Self::IdempotencyKeyInUse => StatusCode::CONFLICT,
            Self::EmptyCart | Self::InvalidCart => StatusCode::BAD_REQUEST,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// Rejections produced by revalidation at confirmation move the session to FAILED.
    pub fn fails_session(&self) -> bool {
        matches!(
            self,
            Self::InvalidLocation
                | Self::CookLocationInvalid
                | Self::CityMismatch
                | Self::DistanceExceeded
                | Self::CouponNotFound
                | Self::CampaignInactive
                | Self::CouponAlreadyRedeemed
                | Self::CouponScopeMismatch
                | Self::MinOrderNotMet
                | Self::AddressRequired
                | Self::InvalidAddress
                | Self::PriceChanged
        )
    }
}

/// A business-rule rejection: a code plus a message fit for the end user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CheckoutRejection {
    pub code: CheckoutErrorCode,
    pub message: String,
}

impl CheckoutRejection {
    pub fn new(code: CheckoutErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Checkout rejected: {0}")]
    Checkout(CheckoutRejection),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<CheckoutRejection> for ServiceError {
    fn from(rejection: CheckoutRejection) -> Self {
        ServiceError::Checkout(rejection)
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(db) => ServiceError::DatabaseError(db),
            StoreError::VersionConflict(id) => ServiceError::ConcurrentModification(id),
            StoreError::DuplicateIdempotencyKey => ServiceError::Checkout(CheckoutRejection::new(
                CheckoutErrorCode::IdempotencyKeyInUse,
                "Idempotency key is already used by another checkout",
            )),
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::Duplicate(what) => ServiceError::InvalidOperation(what),
            StoreError::Serialization(msg) => ServiceError::SerializationError(msg),
        }
    }
}

impl ServiceError {
    /// Shorthand for a business-rule rejection.
    pub fn rejected(code: CheckoutErrorCode, message: impl Into<String>) -> Self {
        ServiceError::Checkout(CheckoutRejection::new(code, message))
    }

    pub fn rejection(&self) -> Option<&CheckoutRejection> {
        match self {
            ServiceError::Checkout(rejection) => Some(rejection),
            _ => None,
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            Self::Checkout(rejection) => rejection.code.status_code(),
            Self::InternalError(_)
            | Self::SerializationError(_)
            | Self::MigrationError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ConcurrentModification(_) => StatusCode::CONFLICT,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::MigrationError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::Checkout(rejection) => rejection.message.clone(),
            Self::ConcurrentModification(id) => {
                format!("Checkout session {} was modified concurrently, please retry", id)
            }
            _ => self.to_string(),
        }
    }

    pub fn error_code(&self) -> Option<CheckoutErrorCode> {
        self.rejection().map(|rejection| rejection.code)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            error_code: self.error_code(),
            message: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

/// API Error type for HTTP responses
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Service error: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {message}")]
    BadRequest {
        message: String,
        error_code: Option<CheckoutErrorCode>,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, error_message) = match self {
            ApiError::ServiceError(service_error) => {
                return service_error.into_response();
            }
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, None, msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                None,
                "Unauthorized".to_string(),
            ),
            ApiError::BadRequest {
                message,
                error_code,
            } => (StatusCode::BAD_REQUEST, error_code, message),
        };

        let error_response = ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
            error_code,
            message: error_message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::str::FromStr;

    #[tokio::test]
    async fn rejection_response_carries_error_code() {
        let response = ServiceError::rejected(
            CheckoutErrorCode::DistanceExceeded,
            "Delivery address is too far from the kitchen",
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.error_code, Some(CheckoutErrorCode::DistanceExceeded));
        assert_eq!(payload.message, "Delivery address is too far from the kitchen");
    }

    #[tokio::test]
    async fn api_error_delegates_to_service_error_response() {
        let response =
            ApiError::ServiceError(ServiceError::NotFound("session".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(payload.error_code.is_none());
    }

    #[test]
    fn error_codes_round_trip_as_screaming_snake_case() {
        let code = CheckoutErrorCode::CouponAlreadyRedeemed;
        assert_eq!(code.to_string(), "COUPON_ALREADY_REDEEMED");
        assert_eq!(
            serde_json::to_string(&code).unwrap(),
            "\"COUPON_ALREADY_REDEEMED\""
        );
        assert_eq!(
            CheckoutErrorCode::from_str("MIN_ORDER_NOT_MET").unwrap(),
            CheckoutErrorCode::MinOrderNotMet
        );
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            ServiceError::rejected(CheckoutErrorCode::PaymentNotCompleted, "x").status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ServiceError::rejected(CheckoutErrorCode::SessionExpired, "x").status_code(),
            StatusCode::GONE
        );
        assert_eq!(
            ServiceError::ConcurrentModification(Uuid::nil()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn internal_errors_hide_details() {
        assert_eq!(
            ServiceError::SerializationError("bad json".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::NotFound("Checkout session not found".into()).response_message(),
            "Not found: Checkout session not found"
        );
    }

    #[test]
    fn payment_gate_does_not_fail_session() {
        assert!(!CheckoutErrorCode::PaymentNotCompleted.fails_session());
        assert!(CheckoutErrorCode::DistanceExceeded.fails_session());
        assert!(CheckoutErrorCode::PriceChanged.fails_session());
    }
}
