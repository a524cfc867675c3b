use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::{checkout::CartLine, reference::Reference};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignType {
    #[sea_orm(string_value = "COUPON")]
    Coupon,
    #[sea_orm(string_value = "DISCOUNT")]
    Discount,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    #[sea_orm(string_value = "DRAFT")]
    Draft,
    #[sea_orm(string_value = "ACTIVE")]
    Active,
    #[sea_orm(string_value = "PAUSED")]
    Paused,
    #[sea_orm(string_value = "ENDED")]
    Ended,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponStatus {
    #[sea_orm(string_value = "ACTIVE")]
    Active,
    #[sea_orm(string_value = "DISABLED")]
    Disabled,
}

/// Which cart lines a campaign covers. A line is covered when it matches any of
/// the listed cooks, categories or dishes; `apply_to_all` covers everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignScope {
    #[serde(default)]
    pub apply_to_all: bool,
    #[serde(default)]
    pub cook_ids: Vec<Reference>,
    #[serde(default)]
    pub category_ids: Vec<Uuid>,
    #[serde(default)]
    pub dish_ids: Vec<Reference>,
}

impl CampaignScope {
    pub fn all() -> Self {
        Self {
            apply_to_all: true,
            ..Default::default()
        }
    }

    pub fn covers(&self, line: &CartLine) -> bool {
        if self.apply_to_all {
            return true;
        }
        self.cook_ids.contains(&line.cook_id)
            || line
                .category_id
                .map(|category| self.category_ids.contains(&category))
                .unwrap_or(false)
            || self.dish_ids.contains(&line.dish_id)
    }
}

fn default_max_redemptions() -> u32 {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub campaign_type: CampaignType,
    pub status: CampaignStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub scope: CampaignScope,
    /// Percentage, 0 to 100.
    pub discount_percent: Decimal,
    pub max_discount_amount: Option<Decimal>,
    #[serde(default)]
    pub min_order_value: Decimal,
    #[serde(default = "default_max_redemptions")]
    pub max_redemptions_per_user: u32,
    /// Restricts the campaign to one market when set.
    #[serde(default)]
    pub country_code: Option<String>,
}

impl Campaign {
    /// Active status and `start_at <= now <= end_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Active && self.start_at <= now && now <= self.end_at
    }

    pub fn applies_to_country(&self, country_code: &str) -> bool {
        self.country_code
            .as_deref()
            .map(|cc| cc.eq_ignore_ascii_case(country_code))
            .unwrap_or(true)
    }

    /// User already used up their redemptions of this campaign.
    pub fn is_exhausted_for(&self, prior_redemptions: u64) -> bool {
        prior_redemptions >= u64::from(self.max_redemptions_per_user)
    }

    /// Percentage of the eligible subtotal, capped by `max_discount_amount`.
    pub fn discount_for(&self, eligible_subtotal: Decimal) -> Decimal {
        let percent = self.discount_percent.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
        let raw = eligible_subtotal * percent / Decimal::ONE_HUNDRED;
        match self.max_discount_amount {
            Some(cap) if cap >= Decimal::ZERO => raw.min(cap),
            _ => raw,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    pub campaign_id: Uuid,
    pub status: CouponStatus,
    #[serde(default)]
    pub redemptions_count: i64,
}

impl Coupon {
    /// Codes are matched trimmed and upper-cased.
    pub fn normalize_code(raw: &str) -> String {
        raw.trim().to_uppercase()
    }
}

/// Audit row written once per campaign used by a confirmed order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRedemption {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub coupon_id: Option<Uuid>,
    pub user_id: Uuid,
    pub order_id: Uuid,
    pub checkout_session_id: Uuid,
    pub discount_amount: Decimal,
    pub created_at: DateTime<Utc>,
}
