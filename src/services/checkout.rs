//! Checkout session lifecycle: creation, priced mutations and payment state.
//!
//! Every mutation reads the session, applies the change, reprices the whole
//! cart and writes it back guarded by the session version. A lost race is
//! retried from a fresh read up to `max_conflict_retries` times.

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::CheckoutSettings;
use crate::errors::{CheckoutErrorCode, CheckoutRejection, ServiceError};
use crate::events::{Event, EventSender};
use crate::models::{
    AddressSnapshot, CartLine, CheckoutSession, CookPreference, Coupon, FulfillmentMode,
    PaymentMethod, PaymentStatus, PricingBreakdown, ReadyTime, Reference, SessionStatus,
};
use crate::repositories::{CheckoutStore, StoreError};
use crate::services::collaborators::{PaymentGateway, PaymentIntent, ProductCatalog};
use crate::services::geo::GeoGate;
use crate::services::pricing::{CouponOutcome, PricingEngine};

const MAX_CART_LINES: usize = 50;
const MAX_LINE_QUANTITY: u32 = 99;
/// Upper bound for a unit price or delivery fee, in currency units.
const MAX_LINE_AMOUNT: i64 = 1_000_000;
const MIN_IDEMPOTENCY_KEY_LENGTH: usize = 8;
const MAX_IDEMPOTENCY_KEY_LENGTH: usize = 255;

/// A cart line as submitted by the client. Name and price are taken from the
/// catalog when the dish id resolves; legacy dishes must carry them.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CartLineInput {
    pub cook_id: Reference,
    pub dish_id: Reference,
    #[validate(length(max = 200))]
    pub dish_name: Option<String>,
    pub unit_price: Option<Decimal>,
    pub quantity: u32,
    pub fulfillment_mode: FulfillmentMode,
    #[serde(default)]
    pub delivery_fee: Decimal,
    #[serde(default)]
    pub prep_ready: Option<ReadyTime>,
    #[validate(length(max = 500))]
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub category_id: Option<Uuid>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateSessionRequest {
    pub lines: Vec<CartLineInput>,
    #[serde(default)]
    pub cook_preferences: Vec<CookPreference>,
    #[validate(length(equal = 2, message = "Country code must be two letters"))]
    pub country_code: String,
}

/// Session plus the gateway data the client needs to collect a card payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntentResult {
    pub session: CheckoutSession,
    pub intent_id: String,
    pub client_secret: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Changes that reprice a session.
#[derive(Debug, Clone)]
enum Mutation {
    Address(AddressSnapshot),
    ApplyCoupon(String),
    RemoveCoupon,
    PaymentMethod(PaymentMethod),
}

impl Mutation {
    fn name(&self) -> &'static str {
        match self {
            Mutation::Address(_) => "update_address",
            Mutation::ApplyCoupon(_) => "apply_coupon",
            Mutation::RemoveCoupon => "remove_coupon",
            Mutation::PaymentMethod(_) => "set_payment_method",
        }
    }
}

/// Validates a client idempotency key and returns its SHA-256 hex digest.
pub fn hash_idempotency_key(key: &str) -> Result<String, ServiceError> {
    let key = key.trim();
    if key.len() < MIN_IDEMPOTENCY_KEY_LENGTH {
        return Err(ServiceError::ValidationError(format!(
            "Idempotency key must be at least {} characters long",
            MIN_IDEMPOTENCY_KEY_LENGTH
        )));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LENGTH {
        return Err(ServiceError::ValidationError(format!(
            "Idempotency key must be {} characters or fewer",
            MAX_IDEMPOTENCY_KEY_LENGTH
        )));
    }
    if !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ServiceError::ValidationError(
            "Idempotency key must contain visible ASCII characters only".to_string(),
        ));
    }

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Loads a session on behalf of `user_id`. Sessions of other users are reported as missing.
pub(crate) async fn load_owned_session(
    store: &dyn CheckoutStore,
    user_id: Uuid,
    session_id: Uuid,
) -> Result<CheckoutSession, ServiceError> {
    match store.get_session(session_id).await? {
        Some(session) if session.user_id == user_id => Ok(session),
        _ => Err(ServiceError::NotFound(format!(
            "Checkout session {} not found",
            session_id
        ))),
    }
}

fn validate_address(address: &AddressSnapshot) -> Result<AddressSnapshot, ServiceError> {
    let invalid = |message: &str| ServiceError::rejected(CheckoutErrorCode::InvalidAddress, message);

    if address.address_line1.trim().is_empty() {
        return Err(invalid("Address line 1 is required"));
    }
    if address.city.trim().is_empty() {
        return Err(invalid("City is required"));
    }
    let country = address.country_code.trim();
    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(invalid("Country code must be two letters"));
    }

    let mut normalized = address.clone();
    normalized.address_line1 = address.address_line1.trim().to_string();
    normalized.city = address.city.trim().to_string();
    normalized.country_code = country.to_ascii_uppercase();
    Ok(normalized)
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn CheckoutStore>,
    pricing: Arc<PricingEngine>,
    geo: Arc<GeoGate>,
    catalog: Arc<dyn ProductCatalog>,
    payments: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        pricing: Arc<PricingEngine>,
        geo: Arc<GeoGate>,
        catalog: Arc<dyn ProductCatalog>,
        payments: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            store,
            pricing,
            geo,
            catalog,
            payments,
            event_sender,
            settings,
        }
    }

    /// Snapshots the cart, prices it and stores a new PRICED session.
    #[instrument(skip(self, request), fields(lines = request.lines.len()))]
    pub async fn create_session(
        &self,
        user_id: Uuid,
        request: CreateSessionRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        request.validate()?;
        let cart = self.snapshot_cart(&request.lines).await?;

        let now = Utc::now();
        let mut session = CheckoutSession {
            id: Uuid::new_v4(),
            user_id,
            status: SessionStatus::Draft,
            country_code: request.country_code.trim().to_ascii_uppercase(),
            cart,
            cook_preferences: request.cook_preferences,
            address: None,
            pricing: PricingBreakdown::default(),
            auto_discounts: Vec::new(),
            applied_coupon: None,
            payment_method: PaymentMethod::Cash,
            payment_status: PaymentStatus::Unpaid,
            payment_intent_id: None,
            payment_amount: None,
            idempotency_key: None,
            order_id: None,
            messages: Vec::new(),
            failure: None,
            version: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + self.settings.session_ttl(),
        };

        self.reprice(&mut session, None, false, now).await?;
        self.store.insert_session(&session).await?;

        counter!("foodie_checkout.sessions.created", 1);
        self.event_sender.send_or_log(Event::CheckoutStarted {
            session_id: session.id,
            user_id,
        });
        info!(session_id = %session.id, %user_id, total = %session.pricing.total, "Created checkout session");
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn get_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<CheckoutSession, ServiceError> {
        let session = load_owned_session(self.store.as_ref(), user_id, session_id).await?;
        if session.status != SessionStatus::Confirmed && session.is_expired(Utc::now()) {
            return Err(ServiceError::rejected(
                CheckoutErrorCode::SessionExpired,
                "Checkout session has expired",
            ));
        }
        Ok(session)
    }

    /// Validates the address against every cook in the cart and reprices with its country's VAT.
    #[instrument(skip(self, address))]
    pub async fn update_address(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        address: AddressSnapshot,
    ) -> Result<CheckoutSession, ServiceError> {
        let address = validate_address(&address)?;
        self.mutate(user_id, session_id, Mutation::Address(address))
            .await
    }

    #[instrument(skip(self))]
    pub async fn apply_coupon(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        code: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        let code = Coupon::normalize_code(code);
        if code.is_empty() {
            return Err(ServiceError::rejected(
                CheckoutErrorCode::CouponNotFound,
                "Please enter a coupon code",
            ));
        }
        let session = self
            .mutate(user_id, session_id, Mutation::ApplyCoupon(code.clone()))
            .await?;
        if let Some(applied) = &session.applied_coupon {
            self.event_sender.send_or_log(Event::CouponApplied {
                session_id,
                code: applied.code.clone(),
                discount: applied.discount_amount,
            });
        }
        Ok(session)
    }

    #[instrument(skip(self))]
    pub async fn remove_coupon(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<CheckoutSession, ServiceError> {
        self.mutate(user_id, session_id, Mutation::RemoveCoupon)
            .await
    }

    #[instrument(skip(self))]
    pub async fn set_payment_method(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        method: PaymentMethod,
    ) -> Result<CheckoutSession, ServiceError> {
        self.mutate(user_id, session_id, Mutation::PaymentMethod(method))
            .await
    }

    /// Requests a card payment for the current total and moves the session to PAYMENT_PENDING.
    ///
    /// The gateway call has side effects, so a lost version race is reported
    /// to the caller instead of being retried.
    #[instrument(skip(self))]
    pub async fn create_payment_intent(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<PaymentIntentResult, ServiceError> {
        let mut session = load_owned_session(self.store.as_ref(), user_id, session_id).await?;
        let now = Utc::now();
        session.ensure_open(now)?;

        if session.payment_method != PaymentMethod::Card {
            return Err(ServiceError::InvalidOperation(
                "Payment intents are only created for card payments".to_string(),
            ));
        }
        if session.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::rejected(
                CheckoutErrorCode::PaymentMethodLocked,
                "This checkout has already been paid",
            ));
        }
        if session.status == SessionStatus::PaymentPending {
            return Err(ServiceError::InvalidOperation(
                "A payment is already pending for this checkout".to_string(),
            ));
        }
        if session.address.is_none() {
            return Err(ServiceError::rejected(
                CheckoutErrorCode::AddressRequired,
                "Please choose a delivery address before paying",
            ));
        }

        let coupon = session.applied_coupon.as_ref().map(|c| c.code.clone());
        self.reprice(&mut session, coupon, false, now).await?;
        let PaymentIntent {
            id,
            client_secret,
            amount,
            currency,
        } = self
            .payments
            .create_payment_intent(
                session.id,
                session.pricing.total,
                &session.pricing.currency_code,
            )
            .await?;

        session.status = SessionStatus::PaymentPending;
        session.payment_status = PaymentStatus::Unpaid;
        session.payment_intent_id = Some(id.clone());
        session.payment_amount = Some(amount);
        session.updated_at = now;

        let session = self.store.update_session(&session).await.map_err(|e| {
            if let StoreError::VersionConflict(_) = e {
                warn!(%session_id, intent_id = %id, "Payment intent orphaned by a concurrent update");
            }
            ServiceError::from(e)
        })?;

        info!(%session_id, intent_id = %id, %amount, "Payment intent created");
        Ok(PaymentIntentResult {
            session,
            intent_id: id,
            client_secret,
            amount,
            currency,
        })
    }

    /// Applies the gateway's verdict for the pending intent. Paid sessions
    /// return to PRICED ready for confirmation; failed ones drop the intent.
    #[instrument(skip(self))]
    pub async fn record_payment_result(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        intent_id: &str,
        paid: bool,
    ) -> Result<CheckoutSession, ServiceError> {
        for _ in 0..=self.settings.max_conflict_retries {
            let mut session =
                load_owned_session(self.store.as_ref(), user_id, session_id).await?;
            let now = Utc::now();
            session.ensure_open(now)?;

            if session.payment_intent_id.as_deref() != Some(intent_id) {
                return Err(ServiceError::ValidationError(format!(
                    "Payment intent {} does not belong to this checkout",
                    intent_id
                )));
            }
            if session.payment_status == PaymentStatus::Paid {
                return if paid {
                    Ok(session)
                } else {
                    Err(ServiceError::InvalidOperation(
                        "Payment was already recorded as paid".to_string(),
                    ))
                };
            }
            if session.status != SessionStatus::PaymentPending {
                return Err(ServiceError::InvalidOperation(
                    "No payment is pending for this checkout".to_string(),
                ));
            }
            // A paid callback only counts once the gateway agrees.
            if paid && !self.payments.is_paid(intent_id).await? {
                counter!("foodie_checkout.payment.unverified", 1);
                warn!(%session_id, %intent_id, "Payment reported paid but gateway disagrees");
                return Err(ServiceError::rejected(
                    CheckoutErrorCode::PaymentNotCompleted,
                    "Card payment has not been completed",
                ));
            }

            session.status = SessionStatus::Priced;
            if paid {
                session.payment_status = PaymentStatus::Paid;
            } else {
                session.payment_status = PaymentStatus::Failed;
                session.payment_intent_id = None;
                session.payment_amount = None;
            }
            session.updated_at = now;

            match self.store.update_session(&session).await {
                Ok(stored) => {
                    self.event_sender.send_or_log(Event::PaymentRecorded {
                        session_id,
                        intent_id: intent_id.to_string(),
                        paid,
                    });
                    info!(%session_id, paid, "Payment result recorded");
                    return Ok(stored);
                }
                Err(StoreError::VersionConflict(_)) => {
                    counter!("foodie_checkout.version_conflicts", 1, "operation" => "record_payment_result");
                    debug!(%session_id, "Version conflict recording payment, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::ConcurrentModification(session_id))
    }

    /// Removes unconfirmed sessions past their expiry.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let purged = self.store.purge_expired(now).await?;
        if purged > 0 {
            counter!("foodie_checkout.sessions.expired", purged);
            self.event_sender
                .send_or_log(Event::SessionsExpired { purged });
        }
        Ok(purged)
    }

    async fn mutate(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        mutation: Mutation,
    ) -> Result<CheckoutSession, ServiceError> {
        for attempt in 0..=self.settings.max_conflict_retries {
            let mut session =
                load_owned_session(self.store.as_ref(), user_id, session_id).await?;
            let now = Utc::now();

            session.ensure_open(now)?;
            if matches!(mutation, Mutation::PaymentMethod(_)) {
                if session.status == SessionStatus::PaymentPending
                    || session.payment_status == PaymentStatus::Paid
                {
                    return Err(ServiceError::rejected(
                        CheckoutErrorCode::PaymentMethodLocked,
                        "Payment method cannot change once a payment has started",
                    ));
                }
            }
            session.ensure_mutable(now)?;

            self.apply(&mut session, &mutation, now).await?;
            session.updated_at = now;

            match self.store.update_session(&session).await {
                Ok(stored) => {
                    debug!(%session_id, operation = mutation.name(), version = stored.version, "Session updated");
                    return Ok(stored);
                }
                Err(StoreError::VersionConflict(_)) => {
                    counter!("foodie_checkout.version_conflicts", 1, "operation" => mutation.name());
                    debug!(%session_id, attempt, operation = mutation.name(), "Version conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%session_id, operation = mutation.name(), "Giving up after repeated version conflicts");
        Err(ServiceError::ConcurrentModification(session_id))
    }

    async fn apply(
        &self,
        session: &mut CheckoutSession,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        match mutation {
            Mutation::Address(address) => {
                self.geo.validate(address, &session.cart).await?;
                session.address = Some(address.clone());
                let coupon = session.applied_coupon.as_ref().map(|c| c.code.clone());
                self.reprice(session, coupon, false, now).await
            }
            Mutation::ApplyCoupon(code) => {
                self.reprice(session, Some(code.clone()), true, now).await
            }
            Mutation::RemoveCoupon => {
                session.applied_coupon = None;
                self.reprice(session, None, false, now).await
            }
            Mutation::PaymentMethod(method) => {
                if *method == PaymentMethod::Cash {
                    session.payment_intent_id = None;
                    session.payment_amount = None;
                }
                session.payment_method = *method;
                session.payment_status = PaymentStatus::Unpaid;
                let coupon = session.applied_coupon.as_ref().map(|c| c.code.clone());
                self.reprice(session, coupon, false, now).await
            }
        }
    }

    /// Recomputes the whole breakdown. With `strict`, a rejected coupon fails
    /// the call; otherwise it is dropped and reported in `messages`.
    async fn reprice(
        &self,
        session: &mut CheckoutSession,
        coupon_code: Option<String>,
        strict: bool,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let outcome = self
            .pricing
            .calculate(
                &session.cart,
                &session.cook_preferences,
                coupon_code.as_deref(),
                session.user_id,
                session.pricing_country(),
                now,
            )
            .await?;

        session.messages.clear();
        match outcome.coupon {
            CouponOutcome::NotRequested => session.applied_coupon = None,
            CouponOutcome::Applied(applied) | CouponOutcome::Retained(applied) => {
                session.applied_coupon = Some(applied)
            }
            CouponOutcome::Rejected(rejection) => {
                if strict {
                    counter!("foodie_checkout.coupon.rejected", 1, "code" => rejection.code.as_ref().to_string());
                    return Err(ServiceError::Checkout(rejection));
                }
                warn!(session_id = %session.id, code = %rejection.code, "Dropping coupon that no longer applies");
                session.applied_coupon = None;
                session.messages.push(rejection.into());
            }
        }

        session.pricing = outcome.breakdown;
        session.auto_discounts = outcome.auto_discounts;
        if session.status == SessionStatus::Draft {
            session.status = SessionStatus::Priced;
        }
        Ok(())
    }

    async fn snapshot_cart(&self, lines: &[CartLineInput]) -> Result<Vec<CartLine>, ServiceError> {
        if lines.is_empty() {
            return Err(ServiceError::rejected(
                CheckoutErrorCode::EmptyCart,
                "Your cart is empty",
            ));
        }
        if lines.len() > MAX_CART_LINES {
            return Err(invalid_cart(format!(
                "A cart can hold at most {} lines",
                MAX_CART_LINES
            )));
        }

        let mut cart = Vec::with_capacity(lines.len());
        for input in lines {
            input.validate()?;
            if input.quantity == 0 || input.quantity > MAX_LINE_QUANTITY {
                return Err(invalid_cart(format!(
                    "Quantity must be between 1 and {}",
                    MAX_LINE_QUANTITY
                )));
            }
            if input.delivery_fee < Decimal::ZERO {
                return Err(invalid_cart("Delivery fee cannot be negative"));
            }
            if input.delivery_fee > Decimal::from(MAX_LINE_AMOUNT) {
                return Err(invalid_cart(format!(
                    "Delivery fee cannot exceed {}",
                    MAX_LINE_AMOUNT
                )));
            }

            let (dish_name, unit_price, category_id, image) = match input.dish_id.as_uuid() {
                Some(dish_id) => match self.catalog.get_dish(dish_id).await? {
                    Some(dish) => (
                        dish.name,
                        dish.price,
                        dish.category_id.or(input.category_id),
                        dish.image.or_else(|| input.image.clone()),
                    ),
                    None => {
                        return Err(invalid_cart(format!(
                            "Dish {} is no longer available",
                            dish_id
                        )))
                    }
                },
                None => match (&input.dish_name, input.unit_price) {
                    (Some(name), Some(price)) if !name.trim().is_empty() => (
                        name.trim().to_string(),
                        price,
                        input.category_id,
                        input.image.clone(),
                    ),
                    _ => {
                        return Err(invalid_cart(format!(
                            "Dish {} needs a name and price",
                            input.dish_id
                        )))
                    }
                },
            };
            if unit_price < Decimal::ZERO {
                return Err(invalid_cart("Dish price cannot be negative"));
            }
            if unit_price > Decimal::from(MAX_LINE_AMOUNT) {
                return Err(invalid_cart(format!(
                    "Dish price cannot exceed {}",
                    MAX_LINE_AMOUNT
                )));
            }

            cart.push(CartLine {
                cook_id: input.cook_id.clone(),
                dish_id: input.dish_id.clone(),
                dish_name,
                unit_price,
                quantity: input.quantity,
                fulfillment_mode: input.fulfillment_mode,
                delivery_fee: input.delivery_fee,
                prep_ready: input.prep_ready.clone(),
                notes: input.notes.clone(),
                category_id,
                image,
            });
        }
        Ok(cart)
    }
}

fn invalid_cart(message: impl Into<String>) -> ServiceError {
    ServiceError::Checkout(CheckoutRejection::new(CheckoutErrorCode::InvalidCart, message))
}
