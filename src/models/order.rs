use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    catalog::CookLocation,
    checkout::{
        AddressSnapshot, AppliedCoupon, FulfillmentMode, PaymentMethod, PaymentStatus,
        PricingBreakdown, TimingPreference,
    },
    reference::Reference,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub dish_id: Reference,
    pub dish_name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub line_total: Decimal,
    pub notes: Option<String>,
    pub image: Option<String>,
    pub category_id: Option<Uuid>,
}

/// One cook's share of an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubOrder {
    pub id: Uuid,
    pub cook_id: Reference,
    pub fulfillment_mode: FulfillmentMode,
    pub timing_preference: TimingPreference,
    pub delivery_fee: Decimal,
    pub subtotal: Decimal,
    /// Set for combined timing: when the last dish of this cook is ready.
    pub combined_ready_time: Option<DateTime<Utc>>,
    pub cook_location: Option<CookLocation>,
    pub items: Vec<OrderItem>,
}

/// Tax configuration and amounts frozen at confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatSnapshot {
    pub country_code: String,
    pub enabled: bool,
    pub rate: Decimal,
    pub label: String,
    pub currency_code: String,
    pub vat_amount: Decimal,
    pub net_total: Decimal,
    pub total: Decimal,
}

impl From<&PricingBreakdown> for VatSnapshot {
    fn from(pricing: &PricingBreakdown) -> Self {
        Self {
            country_code: pricing.country_code.clone(),
            enabled: pricing.vat_enabled,
            rate: pricing.vat_rate,
            label: pricing.vat_label.clone(),
            currency_code: pricing.currency_code.clone(),
            vat_amount: pricing.vat_amount,
            net_total: pricing.net_total,
            total: pricing.total,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub checkout_session_id: Uuid,
    /// SHA-256 digest of the confirmation idempotency key.
    pub idempotency_key: String,
    pub sub_orders: Vec<SubOrder>,
    pub delivery_address: Option<AddressSnapshot>,
    pub pricing: PricingBreakdown,
    pub vat_snapshot: VatSnapshot,
    pub applied_coupon: Option<AppliedCoupon>,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn cook_ids(&self) -> Vec<Reference> {
        self.sub_orders.iter().map(|s| s.cook_id.clone()).collect()
    }
}
