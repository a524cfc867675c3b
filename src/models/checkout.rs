use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{CheckoutErrorCode, CheckoutRejection};
use crate::models::reference::Reference;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    #[sea_orm(string_value = "DRAFT")]
    Draft,
    #[sea_orm(string_value = "PRICED")]
    Priced,
    #[sea_orm(string_value = "PAYMENT_PENDING")]
    PaymentPending,
    #[sea_orm(string_value = "CONFIRMED")]
    Confirmed,
    #[sea_orm(string_value = "FAILED")]
    Failed,
    #[sea_orm(string_value = "EXPIRED")]
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed | Self::Expired)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfillmentMode {
    Pickup,
    Delivery,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingPreference {
    #[default]
    Combined,
    Separate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[default]
    Cash,
    Card,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    Paid,
    Failed,
}

/// Preparation time as sent by clients: whole minutes or "HH:MM" hours and
/// minutes. Both are durations from the moment the order is placed, so
/// "01:30" means ready in 90 minutes. Any other JSON value is kept as sent
/// and falls back to the default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadyTime {
    Minutes(i64),
    Text(String),
    Unparsed(serde_json::Value),
}

impl ReadyTime {
    /// Normalizes to minutes. "HH:MM" becomes hours * 60 + minutes; anything
    /// unparseable or negative falls back to `default_minutes`.
    pub fn normalized_minutes(&self, default_minutes: u32) -> u32 {
        match self {
            ReadyTime::Minutes(minutes) => u32::try_from(*minutes).unwrap_or(default_minutes),
            ReadyTime::Text(text) => parse_ready_text(text).unwrap_or(default_minutes),
            ReadyTime::Unparsed(_) => default_minutes,
        }
    }
}

fn parse_ready_text(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.split_once(':') {
        Some((hours, minutes)) => {
            let hours: u32 = hours.trim().parse().ok()?;
            let minutes: u32 = minutes.trim().parse().ok()?;
            if hours > 23 || minutes > 59 {
                return None;
            }
            Some(hours * 60 + minutes)
        }
        None => text.parse().ok(),
    }
}

/// Minutes for an optional ready-time, with the configured fallback.
pub fn ready_minutes(ready: Option<&ReadyTime>, default_minutes: u32) -> u32 {
    ready
        .map(|r| r.normalized_minutes(default_minutes))
        .unwrap_or(default_minutes)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub cook_id: Reference,
    pub dish_id: Reference,
    pub dish_name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub fulfillment_mode: FulfillmentMode,
    #[serde(default)]
    pub delivery_fee: Decimal,
    #[serde(default)]
    pub prep_ready: Option<ReadyTime>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub category_id: Option<Uuid>,
    #[serde(default)]
    pub image: Option<String>,
}

impl CartLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookPreference {
    pub cook_id: Reference,
    #[serde(default)]
    pub timing_preference: TimingPreference,
}

/// Timing preference for a cook; a missing entry means combined.
pub fn timing_preference_for(preferences: &[CookPreference], cook_id: &Reference) -> TimingPreference {
    preferences
        .iter()
        .find(|p| &p.cook_id == cook_id)
        .map(|p| p.timing_preference)
        .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressSnapshot {
    pub address_line1: String,
    #[serde(default)]
    pub address_line2: Option<String>,
    pub city: String,
    pub country_code: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub delivery_notes: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingBreakdown {
    pub subtotal: Decimal,
    pub auto_discount: Decimal,
    pub coupon_discount: Decimal,
    pub delivery_fee: Decimal,
    pub vat_amount: Decimal,
    pub net_total: Decimal,
    pub total: Decimal,
    pub vat_enabled: bool,
    pub vat_rate: Decimal,
    pub vat_label: String,
    pub country_code: String,
    pub currency_code: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCoupon {
    pub code: String,
    pub coupon_id: Uuid,
    pub campaign_id: Uuid,
    pub discount_amount: Decimal,
}

/// Automatic discount contributed by one campaign.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub campaign_id: Uuid,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub code: CheckoutErrorCode,
    pub message: String,
}

impl From<CheckoutRejection> for SessionMessage {
    fn from(rejection: CheckoutRejection) -> Self {
        Self {
            code: rejection.code,
            message: rejection.message,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SessionStatus,
    pub country_code: String,
    pub cart: Vec<CartLine>,
    #[serde(default)]
    pub cook_preferences: Vec<CookPreference>,
    pub address: Option<AddressSnapshot>,
    pub pricing: PricingBreakdown,
    #[serde(default)]
    pub auto_discounts: Vec<AppliedDiscount>,
    pub applied_coupon: Option<AppliedCoupon>,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub payment_intent_id: Option<String>,
    /// Amount the payment intent was created for.
    pub payment_amount: Option<Decimal>,
    /// SHA-256 digest of the confirmation idempotency key.
    pub idempotency_key: Option<String>,
    pub order_id: Option<Uuid>,
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    pub failure: Option<SessionMessage>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CheckoutSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn timing_preference_for(&self, cook_id: &Reference) -> TimingPreference {
        timing_preference_for(&self.cook_preferences, cook_id)
    }

    /// Country used for pricing: the address country wins over the session default.
    pub fn pricing_country(&self) -> &str {
        self.address
            .as_ref()
            .map(|a| a.country_code.as_str())
            .unwrap_or(self.country_code.as_str())
    }

    /// Fails unless the session still accepts cart, address, coupon and payment-method changes.
    pub fn ensure_mutable(&self, now: DateTime<Utc>) -> Result<(), CheckoutRejection> {
        self.ensure_open(now)?;
        if self.status == SessionStatus::PaymentPending || self.payment_status == PaymentStatus::Paid
        {
            return Err(CheckoutRejection::new(
                CheckoutErrorCode::SessionClosed,
                "Checkout can no longer be changed once payment has started",
            ));
        }
        Ok(())
    }

    /// Fails when the session is expired or has reached a terminal state.
    pub fn ensure_open(&self, now: DateTime<Utc>) -> Result<(), CheckoutRejection> {
        if self.status == SessionStatus::Expired || self.is_expired(now) {
            return Err(CheckoutRejection::new(
                CheckoutErrorCode::SessionExpired,
                "Checkout session has expired",
            ));
        }
        let closed = match self.status {
            SessionStatus::Confirmed => "Checkout session is already confirmed",
            SessionStatus::Failed => "Checkout session has failed, start a new checkout",
            _ => return Ok(()),
        };
        Err(CheckoutRejection::new(CheckoutErrorCode::SessionClosed, closed))
    }
}
