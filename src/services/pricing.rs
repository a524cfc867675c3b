//! Checkout pricing: subtotal, automatic discounts, coupon, batched delivery
//! fees and tax-inclusive VAT reversal.
//!
//! [`calculate_pricing`] is a pure function over a [`PromotionContext`] that
//! [`PricingEngine`] loads from the store beforehand, so recomputing the same
//! inputs always yields the same breakdown.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::{CheckoutSettings, DiscountStacking};
use crate::errors::{CheckoutErrorCode, CheckoutRejection, ServiceError};
use crate::models::{
    checkout::ready_minutes, AppliedCoupon, AppliedDiscount, Campaign, CampaignType, CartLine,
    CookPreference, Coupon, CouponStatus, FulfillmentMode, PricingBreakdown, Reference,
    TimingPreference, VatConfig,
};
use crate::repositories::CheckoutStore;
use crate::services::collaborators::VatSettings;
use crate::services::scope::match_scope;

/// Rounds a monetary amount to 2 decimal places, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone)]
pub struct PricingPolicy {
    pub discount_stacking: DiscountStacking,
    pub default_ready_minutes: u32,
    pub default_currency: String,
}

impl From<&CheckoutSettings> for PricingPolicy {
    fn from(settings: &CheckoutSettings) -> Self {
        Self {
            discount_stacking: settings.discount_stacking,
            default_ready_minutes: settings.default_ready_minutes,
            default_currency: settings.default_currency.clone(),
        }
    }
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self::from(&CheckoutSettings::default())
    }
}

/// A coupon code together with whatever the store resolved it to.
#[derive(Debug, Clone)]
pub struct CouponCandidate {
    pub code: String,
    pub coupon: Option<Coupon>,
    pub campaign: Option<Campaign>,
}

/// Promotion state needed to price one cart for one user.
#[derive(Debug, Clone, Default)]
pub struct PromotionContext {
    pub discount_campaigns: Vec<Campaign>,
    pub coupon: Option<CouponCandidate>,
    /// Prior redemptions by this user, per campaign.
    pub redemptions: HashMap<Uuid, u64>,
    /// Coupon granted earlier whose campaign has since been deleted. Its
    /// discount is kept as granted instead of re-evaluating `coupon`.
    pub retained_coupon: Option<AppliedCoupon>,
}

impl PromotionContext {
    fn redemptions_for(&self, campaign_id: Uuid) -> u64 {
        self.redemptions.get(&campaign_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouponOutcome {
    NotRequested,
    Applied(AppliedCoupon),
    /// Discount honoured for a coupon whose campaign no longer exists.
    Retained(AppliedCoupon),
    Rejected(CheckoutRejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingOutcome {
    pub breakdown: PricingBreakdown,
    pub auto_discounts: Vec<AppliedDiscount>,
    pub coupon: CouponOutcome,
}

/// Computes the full breakdown. A rejected coupon contributes nothing and is
/// reported in [`PricingOutcome::coupon`]; it never aborts the run.
pub fn calculate_pricing(
    cart: &[CartLine],
    preferences: &[CookPreference],
    country_code: &str,
    vat: Option<&VatConfig>,
    promotions: &PromotionContext,
    policy: &PricingPolicy,
    now: DateTime<Utc>,
) -> PricingOutcome {
    let subtotal: Decimal = cart.iter().map(CartLine::line_total).sum();

    let mut remaining = subtotal;
    let mut auto_discount = Decimal::ZERO;
    let mut auto_discounts = Vec::new();
    for (campaign_id, amount) in automatic_discounts(cart, country_code, promotions, policy, now) {
        let amount = amount.min(remaining);
        if amount <= Decimal::ZERO {
            continue;
        }
        remaining -= amount;
        auto_discount += amount;
        auto_discounts.push(AppliedDiscount {
            campaign_id,
            amount: round_money(amount),
        });
    }

    let (coupon_discount, coupon) = match (&promotions.retained_coupon, &promotions.coupon) {
        (Some(retained), _) => {
            let amount = retained.discount_amount.min(remaining).max(Decimal::ZERO);
            (
                amount,
                CouponOutcome::Retained(AppliedCoupon {
                    discount_amount: round_money(amount),
                    ..retained.clone()
                }),
            )
        }
        (None, None) => (Decimal::ZERO, CouponOutcome::NotRequested),
        (None, Some(candidate)) => match evaluate_coupon(candidate, cart, country_code, promotions, now) {
            Ok((coupon, campaign, amount)) => {
                let amount = amount.min(remaining);
                (
                    amount,
                    CouponOutcome::Applied(AppliedCoupon {
                        code: coupon.code.clone(),
                        coupon_id: coupon.id,
                        campaign_id: campaign.id,
                        discount_amount: round_money(amount),
                    }),
                )
            }
            Err(rejection) => {
                debug!(code = %rejection.code, "Coupon {} rejected", candidate.code);
                (Decimal::ZERO, CouponOutcome::Rejected(rejection))
            }
        },
    };

    let delivery_fee = delivery_fee(cart, preferences, policy.default_ready_minutes);
    let gross = subtotal - auto_discount - coupon_discount + delivery_fee;

    let (vat_enabled, vat_rate, vat_label, currency_code) = match vat {
        Some(config) => (
            config.enabled,
            config.rate,
            config.label.clone(),
            config.currency_code.clone(),
        ),
        None => (
            false,
            Decimal::ZERO,
            "VAT".to_string(),
            policy.default_currency.clone(),
        ),
    };
    let effective_rate = vat.map(VatConfig::effective_rate).unwrap_or(Decimal::ZERO);
    let net = if effective_rate > Decimal::ZERO {
        gross / (Decimal::ONE + effective_rate / Decimal::ONE_HUNDRED)
    } else {
        gross
    };

    let total = round_money(gross);
    let net_total = round_money(net);

    PricingOutcome {
        breakdown: PricingBreakdown {
            subtotal: round_money(subtotal),
            auto_discount: round_money(auto_discount),
            coupon_discount: round_money(coupon_discount),
            delivery_fee: round_money(delivery_fee),
            // Derived so net plus VAT always equals the total.
            vat_amount: total - net_total,
            net_total,
            total,
            vat_enabled,
            vat_rate,
            vat_label,
            country_code: country_code.to_string(),
            currency_code,
        },
        auto_discounts,
        coupon,
    }
}

/// Qualifying automatic discounts, unrounded, in campaign-id order.
fn automatic_discounts(
    cart: &[CartLine],
    country_code: &str,
    promotions: &PromotionContext,
    policy: &PricingPolicy,
    now: DateTime<Utc>,
) -> Vec<(Uuid, Decimal)> {
    let mut qualifying: Vec<(Uuid, Decimal)> = promotions
        .discount_campaigns
        .iter()
        .filter(|c| c.campaign_type == CampaignType::Discount)
        .filter(|c| c.is_live(now) && c.applies_to_country(country_code))
        .filter(|c| !c.is_exhausted_for(promotions.redemptions_for(c.id)))
        .filter_map(|c| {
            let matched = match_scope(&c.scope, cart);
            if !matched.applies || matched.eligible_subtotal < c.min_order_value {
                return None;
            }
            let amount = c.discount_for(matched.eligible_subtotal);
            (amount > Decimal::ZERO).then_some((c.id, amount))
        })
        .collect();
    qualifying.sort_by_key(|(id, _)| *id);

    match policy.discount_stacking {
        DiscountStacking::StackAll => qualifying,
        DiscountStacking::BestSingle => {
            let best = qualifying
                .into_iter()
                .fold(None::<(Uuid, Decimal)>, |best, candidate| match best {
                    Some(current) if current.1 >= candidate.1 => Some(current),
                    _ => Some(candidate),
                });
            best.into_iter().collect()
        }
    }
}

fn evaluate_coupon<'a>(
    candidate: &'a CouponCandidate,
    cart: &[CartLine],
    country_code: &str,
    promotions: &PromotionContext,
    now: DateTime<Utc>,
) -> Result<(&'a Coupon, &'a Campaign, Decimal), CheckoutRejection> {
    let coupon = match &candidate.coupon {
        Some(coupon) if coupon.status == CouponStatus::Active => coupon,
        _ => {
            return Err(CheckoutRejection::new(
                CheckoutErrorCode::CouponNotFound,
                format!("Coupon {} is not valid", candidate.code),
            ))
        }
    };

    let campaign = match &candidate.campaign {
        Some(campaign)
            if campaign.id == coupon.campaign_id
                && campaign.campaign_type == CampaignType::Coupon
                && campaign.is_live(now) =>
        {
            campaign
        }
        _ => {
            return Err(CheckoutRejection::new(
                CheckoutErrorCode::CampaignInactive,
                format!("Coupon {} has expired or is not active", coupon.code),
            ))
        }
    };

    if !campaign.applies_to_country(country_code) {
        return Err(CheckoutRejection::new(
            CheckoutErrorCode::CouponScopeMismatch,
            format!("Coupon {} is not available in your country", coupon.code),
        ));
    }

    if campaign.is_exhausted_for(promotions.redemptions_for(campaign.id)) {
        return Err(CheckoutRejection::new(
            CheckoutErrorCode::CouponAlreadyRedeemed,
            format!("You have already used coupon {}", coupon.code),
        ));
    }

    let matched = match_scope(&campaign.scope, cart);
    if !matched.applies {
        return Err(CheckoutRejection::new(
            CheckoutErrorCode::CouponScopeMismatch,
            format!("Coupon {} does not apply to the items in your cart", coupon.code),
        ));
    }

    if matched.eligible_subtotal < campaign.min_order_value {
        return Err(CheckoutRejection::new(
            CheckoutErrorCode::MinOrderNotMet,
            format!(
                "Coupon {} requires a minimum order of {}",
                coupon.code,
                round_money(campaign.min_order_value)
            ),
        ));
    }

    Ok((coupon, campaign, campaign.discount_for(matched.eligible_subtotal)))
}

/// Cart lines grouped by cook, in order of first appearance.
pub fn group_by_cook(cart: &[CartLine]) -> Vec<(Reference, Vec<&CartLine>)> {
    let mut groups: Vec<(Reference, Vec<&CartLine>)> = Vec::new();
    for line in cart {
        match groups.iter_mut().find(|(cook, _)| cook == &line.cook_id) {
            Some((_, lines)) => lines.push(line),
            None => groups.push((line.cook_id.clone(), vec![line])),
        }
    }
    groups
}

/// Delivery fee for one cook: one trip for combined timing, one trip per
/// distinct ready-time for separate timing. Each trip costs its most
/// expensive line's fee.
pub fn cook_delivery_fee(
    lines: &[&CartLine],
    timing: TimingPreference,
    default_ready_minutes: u32,
) -> Decimal {
    let delivery_lines = lines
        .iter()
        .filter(|line| line.fulfillment_mode == FulfillmentMode::Delivery);

    match timing {
        TimingPreference::Combined => delivery_lines
            .map(|line| line.delivery_fee)
            .max()
            .unwrap_or(Decimal::ZERO),
        TimingPreference::Separate => {
            let mut batches: BTreeMap<u32, Decimal> = BTreeMap::new();
            for line in delivery_lines {
                let minutes = ready_minutes(line.prep_ready.as_ref(), default_ready_minutes);
                let fee = batches.entry(minutes).or_insert(Decimal::ZERO);
                *fee = (*fee).max(line.delivery_fee);
            }
            batches.values().copied().sum()
        }
    }
}

/// Total delivery fee across every cook in the cart.
pub fn delivery_fee(
    cart: &[CartLine],
    preferences: &[CookPreference],
    default_ready_minutes: u32,
) -> Decimal {
    group_by_cook(cart)
        .iter()
        .map(|(cook, lines)| {
            let timing = crate::models::checkout::timing_preference_for(preferences, cook);
            cook_delivery_fee(lines, timing, default_ready_minutes)
        })
        .sum()
}

/// Loads promotion and VAT state, then prices the cart.
#[derive(Clone)]
pub struct PricingEngine {
    store: Arc<dyn CheckoutStore>,
    vat: Arc<dyn VatSettings>,
    policy: PricingPolicy,
}

impl PricingEngine {
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        vat: Arc<dyn VatSettings>,
        policy: PricingPolicy,
    ) -> Self {
        Self { store, vat, policy }
    }

    pub fn policy(&self) -> &PricingPolicy {
        &self.policy
    }

    #[instrument(skip(self, cart, preferences))]
    pub async fn calculate(
        &self,
        cart: &[CartLine],
        preferences: &[CookPreference],
        coupon_code: Option<&str>,
        user_id: Uuid,
        country_code: &str,
        now: DateTime<Utc>,
    ) -> Result<PricingOutcome, ServiceError> {
        let promotions = self.load_promotions(coupon_code, user_id, now).await?;
        self.price(cart, preferences, country_code, &promotions, now)
            .await
    }

    /// Final pricing before an order is written. A coupon whose campaign was
    /// deleted after it was applied keeps its granted discount; one whose
    /// campaign still exists is evaluated as usual.
    #[instrument(skip(self, cart, preferences, applied))]
    pub async fn calculate_for_confirmation(
        &self,
        cart: &[CartLine],
        preferences: &[CookPreference],
        applied: Option<&AppliedCoupon>,
        user_id: Uuid,
        country_code: &str,
        now: DateTime<Utc>,
    ) -> Result<PricingOutcome, ServiceError> {
        let mut promotions = self
            .load_promotions(applied.map(|c| c.code.as_str()), user_id, now)
            .await?;
        if let Some(applied) = applied {
            let resolved = promotions
                .coupon
                .as_ref()
                .map_or(false, |candidate| candidate.campaign.is_some());
            if !resolved && self.store.get_campaign(applied.campaign_id).await?.is_none() {
                warn!(
                    campaign_id = %applied.campaign_id,
                    code = %applied.code,
                    "Coupon campaign was deleted, keeping the granted discount"
                );
                promotions.retained_coupon = Some(applied.clone());
            }
        }
        self.price(cart, preferences, country_code, &promotions, now)
            .await
    }

    async fn price(
        &self,
        cart: &[CartLine],
        preferences: &[CookPreference],
        country_code: &str,
        promotions: &PromotionContext,
        now: DateTime<Utc>,
    ) -> Result<PricingOutcome, ServiceError> {
        let vat = self.vat.vat_config(country_code).await?;
        Ok(calculate_pricing(
            cart,
            preferences,
            country_code,
            vat.as_ref(),
            promotions,
            &self.policy,
            now,
        ))
    }

    async fn load_promotions(
        &self,
        coupon_code: Option<&str>,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PromotionContext, ServiceError> {
        let discount_campaigns = self.store.active_discount_campaigns(now).await?;

        let coupon = match coupon_code {
            Some(raw) => {
                let code = Coupon::normalize_code(raw);
                let coupon = self.store.find_coupon_by_code(&code).await?;
                let campaign = match &coupon {
                    Some(coupon) => self.store.get_campaign(coupon.campaign_id).await?,
                    None => None,
                };
                Some(CouponCandidate {
                    code,
                    coupon,
                    campaign,
                })
            }
            None => None,
        };

        let mut redemptions = HashMap::new();
        let campaign_ids = discount_campaigns
            .iter()
            .map(|c| c.id)
            .chain(coupon.iter().filter_map(|c| c.campaign.as_ref().map(|c| c.id)));
        for campaign_id in campaign_ids {
            if redemptions.contains_key(&campaign_id) {
                continue;
            }
            let count = self.store.count_redemptions(campaign_id, user_id).await?;
            redemptions.insert(campaign_id, count);
        }

        Ok(PromotionContext {
            discount_campaigns,
            coupon,
            redemptions,
            retained_coupon: None,
        })
    }
}
