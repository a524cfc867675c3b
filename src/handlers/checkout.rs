use axum::{
    async_trait,
    extract::{FromRequestParts, Json, Path, State},
    http::{header::LOCATION, request::Parts, HeaderMap, HeaderValue},
    response::Response,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

use super::common::{created_response, map_service_error, success_response, validate_input};
use crate::{
    errors::ApiError,
    models::{AddressSnapshot, PaymentMethod},
    services::CreateSessionRequest,
    AppState,
};

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Caller identity established upstream and forwarded as a header.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(|user_id| CurrentUser { user_id })
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AddressRequest {
    #[validate(length(min = 1, max = 200))]
    pub address_line1: String,
    #[validate(length(max = 200))]
    pub address_line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(equal = 2))]
    pub country_code: String,
    #[validate(length(max = 50))]
    pub label: Option<String>,
    #[validate(length(max = 500))]
    pub delivery_notes: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl From<AddressRequest> for AddressSnapshot {
    fn from(req: AddressRequest) -> Self {
        Self {
            address_line1: req.address_line1,
            address_line2: req.address_line2,
            city: req.city,
            country_code: req.country_code,
            label: req.label,
            delivery_notes: req.delivery_notes,
            lat: req.lat,
            lng: req.lng,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ApplyCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentMethodRequest {
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PaymentResultRequest {
    #[validate(length(min = 1, max = 255))]
    pub intent_id: String,
    pub paid: bool,
}

/// Creates the router for checkout session endpoints
pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout/sessions", post(create_session))
        .route("/checkout/sessions/:id", get(get_session))
        .route("/checkout/sessions/:id/address", put(update_address))
        .route(
            "/checkout/sessions/:id/coupon",
            post(apply_coupon).delete(remove_coupon),
        )
        .route(
            "/checkout/sessions/:id/payment-method",
            put(set_payment_method),
        )
        .route(
            "/checkout/sessions/:id/payment-intent",
            post(create_payment_intent),
        )
        .route(
            "/checkout/sessions/:id/payment-result",
            post(record_payment_result),
        )
        .route("/checkout/sessions/:id/confirm", post(confirm))
}

/// Create a checkout session from a cart
async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<Response, ApiError> {
    validate_input(&payload)?;
    let session = state
        .services
        .checkout
        .create_session(user.user_id, payload)
        .await
        .map_err(map_service_error)?;

    let mut response = created_response(&session);
    if let Ok(location) =
        HeaderValue::from_str(&format!("/api/v1/checkout/sessions/{}", session.id))
    {
        response.headers_mut().insert(LOCATION, location);
    }
    Ok(response)
}

async fn get_session(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state
        .services
        .checkout
        .get_session(user.user_id, id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(session))
}

async fn update_address(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<AddressRequest>,
) -> Result<Response, ApiError> {
    validate_input(&payload)?;
    let session = state
        .services
        .checkout
        .update_address(user.user_id, id, payload.into())
        .await
        .map_err(map_service_error)?;
    Ok(success_response(session))
}

async fn apply_coupon(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<Response, ApiError> {
    validate_input(&payload)?;
    let session = state
        .services
        .checkout
        .apply_coupon(user.user_id, id, &payload.code)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(session))
}

async fn remove_coupon(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state
        .services
        .checkout
        .remove_coupon(user.user_id, id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(session))
}

async fn set_payment_method(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<PaymentMethodRequest>,
) -> Result<Response, ApiError> {
    let session = state
        .services
        .checkout
        .set_payment_method(user.user_id, id, payload.payment_method)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(session))
}

async fn create_payment_intent(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let result = state
        .services
        .checkout
        .create_payment_intent(user.user_id, id)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(result))
}

/// Gateway callback shim reporting the outcome of a card payment
async fn record_payment_result(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<PaymentResultRequest>,
) -> Result<Response, ApiError> {
    validate_input(&payload)?;
    let session = state
        .services
        .checkout
        .record_payment_result(user.user_id, id, &payload.intent_id, payload.paid)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(session))
}

/// Confirm the session into an order; safe to retry with the same Idempotency-Key
async fn confirm(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .ok_or_else(|| ApiError::BadRequest {
            message: "Idempotency-Key header is required".to_string(),
            error_code: None,
        })?
        .to_str()
        .map_err(|_| ApiError::BadRequest {
            message: "Idempotency-Key must be valid ASCII".to_string(),
            error_code: None,
        })?
        .to_owned();

    let order = state
        .services
        .confirmation
        .confirm(user.user_id, id, &key)
        .await
        .map_err(map_service_error)?;
    debug!(session_id = %id, order_id = %order.id, "Confirm request served");

    let mut response = success_response(&order);
    if let Ok(value) = HeaderValue::from_str(&key) {
        response.headers_mut().insert(IDEMPOTENCY_KEY_HEADER, value);
    }
    Ok(response)
}
