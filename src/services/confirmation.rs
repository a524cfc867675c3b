//! Turns a priced checkout session into an order, exactly once per session.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CheckoutSettings;
use crate::errors::{CheckoutErrorCode, CheckoutRejection, ServiceError};
use crate::events::{Event, EventSender};
use crate::models::{
    checkout::ready_minutes, CampaignRedemption, CheckoutSession, CookLocation, FulfillmentMode,
    Order, OrderItem, PaymentMethod, PaymentStatus, Reference, SessionStatus, SubOrder,
    TimingPreference, VatSnapshot,
};
use crate::repositories::{CheckoutStore, ConfirmationUnit, StoreError};
use crate::services::checkout::{hash_idempotency_key, load_owned_session};
use crate::services::collaborators::PaymentGateway;
use crate::services::geo::GeoGate;
use crate::services::pricing::{
    cook_delivery_fee, group_by_cook, round_money, CouponOutcome, PricingEngine, PricingOutcome,
};

/// Splits the cart into one sub-order per cook, in cart order. A combined
/// sub-order is ready once its slowest line is, counting each line's
/// prep-ready value as a duration from `now`.
pub fn build_sub_orders(
    session: &CheckoutSession,
    locations: &HashMap<Reference, CookLocation>,
    default_ready_minutes: u32,
    now: DateTime<Utc>,
) -> Vec<SubOrder> {
    group_by_cook(&session.cart)
        .into_iter()
        .map(|(cook_id, lines)| {
            let timing = session.timing_preference_for(&cook_id);
            let fulfillment_mode = if lines
                .iter()
                .any(|line| line.fulfillment_mode == FulfillmentMode::Delivery)
            {
                FulfillmentMode::Delivery
            } else {
                FulfillmentMode::Pickup
            };

            let combined_ready_time = match timing {
                TimingPreference::Combined => lines
                    .iter()
                    .map(|line| ready_minutes(line.prep_ready.as_ref(), default_ready_minutes))
                    .max()
                    .map(|minutes| now + Duration::minutes(i64::from(minutes))),
                TimingPreference::Separate => None,
            };

            let items: Vec<OrderItem> = lines
                .iter()
                .map(|line| OrderItem {
                    dish_id: line.dish_id.clone(),
                    dish_name: line.dish_name.clone(),
                    unit_price: line.unit_price,
                    quantity: line.quantity,
                    line_total: round_money(line.line_total()),
                    notes: line.notes.clone(),
                    image: line.image.clone(),
                    category_id: line.category_id,
                })
                .collect();

            SubOrder {
                id: Uuid::new_v4(),
                delivery_fee: round_money(cook_delivery_fee(
                    &lines,
                    timing,
                    default_ready_minutes,
                )),
                subtotal: round_money(lines.iter().map(|line| line.line_total()).sum()),
                cook_location: locations.get(&cook_id).cloned(),
                cook_id,
                fulfillment_mode,
                timing_preference: timing,
                combined_ready_time,
                items,
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct ConfirmationService {
    store: Arc<dyn CheckoutStore>,
    pricing: Arc<PricingEngine>,
    geo: Arc<GeoGate>,
    payments: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    settings: CheckoutSettings,
}

impl ConfirmationService {
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        pricing: Arc<PricingEngine>,
        geo: Arc<GeoGate>,
        payments: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            store,
            pricing,
            geo,
            payments,
            event_sender,
            settings,
        }
    }

    /// Confirms the session and returns its order. Replaying the same key
    /// returns the order created by the first successful call.
    #[instrument(skip(self, idempotency_key))]
    pub async fn confirm(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Order, ServiceError> {
        let key_hash = hash_idempotency_key(idempotency_key)?;

        for attempt in 0..=self.settings.max_conflict_retries {
            let mut session =
                load_owned_session(self.store.as_ref(), user_id, session_id).await?;
            let now = Utc::now();

            if session.status == SessionStatus::Confirmed {
                if session.idempotency_key.as_deref() == Some(key_hash.as_str()) {
                    debug!(%session_id, "Replaying confirmation");
                    return self.existing_order(&session, &key_hash).await;
                }
                return Err(ServiceError::rejected(
                    CheckoutErrorCode::SessionClosed,
                    "Checkout session is already confirmed",
                ));
            }
            session.ensure_open(now)?;
            self.ensure_paid(&mut session).await?;

            let (locations, pricing) = match self.revalidate(&session, now).await {
                Ok(validated) => validated,
                Err(err) => {
                    if let Some(rejection) = err.rejection() {
                        if rejection.code.fails_session() {
                            self.fail_session(session, rejection.clone(), now).await?;
                        }
                    }
                    return Err(err);
                }
            };

            let unit = self
                .build_confirmation(session, locations, pricing, &key_hash, now)
                .await?;
            let order = unit.order.clone();

            match self.store.commit_confirmation(unit).await {
                Ok(_) => {
                    counter!("foodie_checkout.orders.confirmed", 1);
                    self.event_sender.send_or_log(Event::OrderConfirmed {
                        session_id,
                        order_id: order.id,
                        user_id,
                        total: order.pricing.total,
                        cook_ids: order.cook_ids().iter().map(ToString::to_string).collect(),
                        confirmed_at: now,
                    });
                    info!(
                        %session_id,
                        order_id = %order.id,
                        total = %order.pricing.total,
                        sub_orders = order.sub_orders.len(),
                        "Checkout confirmed"
                    );
                    return Ok(order);
                }
                Err(StoreError::VersionConflict(_)) => {
                    counter!("foodie_checkout.version_conflicts", 1, "operation" => "confirm");
                    debug!(%session_id, attempt, "Version conflict confirming, retrying");
                }
                Err(StoreError::DuplicateIdempotencyKey) => {
                    return match self.store.find_order_by_idempotency_key(&key_hash).await? {
                        Some(existing) if existing.checkout_session_id == session_id => {
                            Ok(existing)
                        }
                        _ => Err(ServiceError::rejected(
                            CheckoutErrorCode::IdempotencyKeyInUse,
                            "Idempotency key is already used by another checkout",
                        )),
                    };
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(%session_id, "Giving up confirmation after repeated version conflicts");
        Err(ServiceError::ConcurrentModification(session_id))
    }

    async fn existing_order(
        &self,
        session: &CheckoutSession,
        key_hash: &str,
    ) -> Result<Order, ServiceError> {
        let order = match session.order_id {
            Some(order_id) => self.store.get_order(order_id).await?,
            None => None,
        };
        let order = match order {
            Some(order) => Some(order),
            None => self.store.find_order_by_idempotency_key(key_hash).await?,
        };
        order.ok_or_else(|| {
            error!(session_id = %session.id, "Confirmed session has no order");
            ServiceError::InternalError(format!(
                "Order for checkout session {} is missing",
                session.id
            ))
        })
    }

    /// Card sessions must be paid. A pending intent is checked with the gateway once.
    async fn ensure_paid(&self, session: &mut CheckoutSession) -> Result<(), ServiceError> {
        if session.payment_method != PaymentMethod::Card
            || session.payment_status == PaymentStatus::Paid
        {
            return Ok(());
        }
        if let Some(intent_id) = &session.payment_intent_id {
            if self.payments.is_paid(intent_id).await? {
                debug!(session_id = %session.id, "Gateway reports intent as paid");
                session.payment_status = PaymentStatus::Paid;
                session.status = SessionStatus::Priced;
                return Ok(());
            }
        }
        counter!("foodie_checkout.confirm.rejected", 1, "code" => "PAYMENT_NOT_COMPLETED");
        Err(ServiceError::rejected(
            CheckoutErrorCode::PaymentNotCompleted,
            "Card payment has not been completed",
        ))
    }

    /// Final geo and pricing pass against current data.
    async fn revalidate(
        &self,
        session: &CheckoutSession,
        now: DateTime<Utc>,
    ) -> Result<(HashMap<Reference, CookLocation>, PricingOutcome), ServiceError> {
        let address = session.address.as_ref().ok_or_else(|| {
            ServiceError::rejected(
                CheckoutErrorCode::AddressRequired,
                "Please choose a delivery address",
            )
        })?;
        let locations = self.geo.validate(address, &session.cart).await?;

        let outcome = self
            .pricing
            .calculate_for_confirmation(
                &session.cart,
                &session.cook_preferences,
                session.applied_coupon.as_ref(),
                session.user_id,
                session.pricing_country(),
                now,
            )
            .await?;
        if let CouponOutcome::Rejected(rejection) = &outcome.coupon {
            return Err(ServiceError::Checkout(rejection.clone()));
        }

        if session.payment_method == PaymentMethod::Card {
            if let Some(paid) = session.payment_amount {
                if round_money(paid) != outcome.breakdown.total {
                    return Err(ServiceError::rejected(
                        CheckoutErrorCode::PriceChanged,
                        format!(
                            "Order total changed from {} to {} after payment",
                            round_money(paid),
                            outcome.breakdown.total
                        ),
                    ));
                }
            }
        }

        Ok((locations, outcome))
    }

    async fn build_confirmation(
        &self,
        session: CheckoutSession,
        locations: HashMap<Reference, CookLocation>,
        pricing: PricingOutcome,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationUnit, ServiceError> {
        let order_id = Uuid::new_v4();
        let (applied_coupon, campaign_known) = match pricing.coupon {
            CouponOutcome::Applied(applied) => (Some(applied), true),
            CouponOutcome::Retained(applied) => (Some(applied), false),
            CouponOutcome::NotRequested | CouponOutcome::Rejected(_) => (None, false),
        };
        let payment_status = match session.payment_method {
            PaymentMethod::Cash => PaymentStatus::Unpaid,
            PaymentMethod::Card => PaymentStatus::Paid,
        };

        let mut redemptions: Vec<CampaignRedemption> = pricing
            .auto_discounts
            .iter()
            .map(|discount| CampaignRedemption {
                id: Uuid::new_v4(),
                campaign_id: discount.campaign_id,
                coupon_id: None,
                user_id: session.user_id,
                order_id,
                checkout_session_id: session.id,
                discount_amount: discount.amount,
                created_at: now,
            })
            .collect();

        let mut coupon_id = None;
        if let Some(applied) = &applied_coupon {
            let campaign = if campaign_known {
                self.store.get_campaign(applied.campaign_id).await?
            } else {
                None
            };
            match campaign {
                Some(_) => {
                    redemptions.push(CampaignRedemption {
                        id: Uuid::new_v4(),
                        campaign_id: applied.campaign_id,
                        coupon_id: Some(applied.coupon_id),
                        user_id: session.user_id,
                        order_id,
                        checkout_session_id: session.id,
                        discount_amount: applied.discount_amount,
                        created_at: now,
                    });
                    coupon_id = Some(applied.coupon_id);
                }
                None => warn!(
                    session_id = %session.id,
                    campaign_id = %applied.campaign_id,
                    "Campaign disappeared before confirmation, skipping redemption record"
                ),
            }
        }

        let order = Order {
            id: order_id,
            user_id: session.user_id,
            checkout_session_id: session.id,
            idempotency_key: key_hash.to_string(),
            sub_orders: build_sub_orders(
                &session,
                &locations,
                self.settings.default_ready_minutes,
                now,
            ),
            delivery_address: session.address.clone(),
            vat_snapshot: VatSnapshot::from(&pricing.breakdown),
            pricing: pricing.breakdown.clone(),
            applied_coupon: applied_coupon.clone(),
            payment_method: session.payment_method,
            payment_status,
            payment_intent_id: session.payment_intent_id.clone(),
            created_at: now,
        };

        let mut confirmed = session;
        confirmed.status = SessionStatus::Confirmed;
        confirmed.payment_status = payment_status;
        confirmed.idempotency_key = Some(key_hash.to_string());
        confirmed.order_id = Some(order_id);
        confirmed.pricing = pricing.breakdown;
        confirmed.auto_discounts = pricing.auto_discounts;
        confirmed.applied_coupon = applied_coupon;
        confirmed.messages.clear();
        confirmed.updated_at = now;

        Ok(ConfirmationUnit {
            session: confirmed,
            order,
            redemptions,
            coupon_id,
        })
    }

    /// Records a terminal validation failure. Losing the write race to a
    /// concurrent writer only skips the transition; the rejection still stands.
    async fn fail_session(
        &self,
        mut session: CheckoutSession,
        rejection: CheckoutRejection,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let session_id = session.id;
        let code = rejection.code;
        session.status = SessionStatus::Failed;
        session.failure = Some(rejection.into());
        session.updated_at = now;

        match self.store.update_session(&session).await {
            Ok(_) => {
                counter!("foodie_checkout.sessions.failed", 1, "code" => code.as_ref().to_string());
                self.event_sender.send_or_log(Event::CheckoutFailed {
                    session_id,
                    code: code.to_string(),
                });
                warn!(%session_id, %code, "Checkout failed at confirmation");
                Ok(())
            }
            Err(StoreError::VersionConflict(_)) => {
                debug!(%session_id, "Session changed while recording failure");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CartLine, CookPreference, PricingBreakdown, ReadyTime};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn line(cook: &Reference, ready: i64, mode: FulfillmentMode, fee: Decimal) -> CartLine {
        CartLine {
            cook_id: cook.clone(),
            dish_id: Reference::Legacy(format!("dish-{}", ready)),
            dish_name: "Kabsa".into(),
            unit_price: dec!(25),
            quantity: 2,
            fulfillment_mode: mode,
            delivery_fee: fee,
            prep_ready: Some(ReadyTime::Minutes(ready)),
            notes: None,
            category_id: None,
            image: None,
        }
    }

    fn session_with(cart: Vec<CartLine>, preferences: Vec<CookPreference>) -> CheckoutSession {
        let now = Utc::now();
        CheckoutSession {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status: SessionStatus::Priced,
            country_code: "SA".into(),
            cart,
            cook_preferences: preferences,
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
            expires_at: now + Duration::hours(2),
        }
    }

    #[test]
    fn groups_lines_into_one_sub_order_per_cook() {
        let a = Reference::Id(Uuid::new_v4());
        let b = Reference::Legacy("cook-b".into());
        let session = session_with(
            vec![
                line(&a, 10, FulfillmentMode::Pickup, dec!(5)),
                line(&b, 15, FulfillmentMode::Pickup, dec!(0)),
                line(&a, 40, FulfillmentMode::Delivery, dec!(8)),
            ],
            vec![],
        );
        let now = Utc::now();
        let sub_orders = build_sub_orders(&session, &HashMap::new(), 30, now);

        assert_eq!(sub_orders.len(), 2);
        assert_eq!(sub_orders[0].cook_id, a);
        assert_eq!(sub_orders[0].items.len(), 2);
        assert_eq!(sub_orders[0].fulfillment_mode, FulfillmentMode::Delivery);
        assert_eq!(sub_orders[0].delivery_fee, dec!(8));
        assert_eq!(sub_orders[0].subtotal, dec!(100));
        assert_eq!(
            sub_orders[0].combined_ready_time,
            Some(now + Duration::minutes(40))
        );
        assert_eq!(sub_orders[1].fulfillment_mode, FulfillmentMode::Pickup);
        assert_eq!(sub_orders[1].delivery_fee, Decimal::ZERO);
    }

    #[test]
    fn clock_style_prep_time_is_a_duration() {
        let a = Reference::Id(Uuid::new_v4());
        let mut slow = line(&a, 10, FulfillmentMode::Delivery, dec!(5));
        slow.prep_ready = Some(ReadyTime::Text("01:30".into()));
        let session = session_with(
            vec![line(&a, 45, FulfillmentMode::Delivery, dec!(5)), slow],
            vec![],
        );
        let now = Utc::now();
        let sub_orders = build_sub_orders(&session, &HashMap::new(), 30, now);
        assert_eq!(
            sub_orders[0].combined_ready_time,
            Some(now + Duration::minutes(90))
        );
    }

    #[test]
    fn separate_timing_has_no_combined_ready_time() {
        let a = Reference::Id(Uuid::new_v4());
        let session = session_with(
            vec![
                line(&a, 10, FulfillmentMode::Delivery, dec!(5)),
                line(&a, 10, FulfillmentMode::Delivery, dec!(7)),
                line(&a, 20, FulfillmentMode::Delivery, dec!(3)),
            ],
            vec![CookPreference {
                cook_id: a.clone(),
                timing_preference: TimingPreference::Separate,
            }],
        );
        let sub_orders = build_sub_orders(&session, &HashMap::new(), 30, Utc::now());

        assert_eq!(sub_orders.len(), 1);
        assert_eq!(sub_orders[0].timing_preference, TimingPreference::Separate);
        assert_eq!(sub_orders[0].combined_ready_time, None);
        assert_eq!(sub_orders[0].delivery_fee, dec!(10));
    }

    #[test]
    fn sub_orders_carry_verified_cook_location() {
        let a = Reference::Id(Uuid::new_v4());
        let session = session_with(vec![line(&a, 10, FulfillmentMode::Delivery, dec!(5))], vec![]);
        let mut locations = HashMap::new();
        locations.insert(
            a.clone(),
            CookLocation {
                lat: Some(24.71),
                lng: Some(46.67),
                city: "Riyadh".into(),
                store_name: "Umm Ali Kitchen".into(),
            },
        );
        let sub_orders = build_sub_orders(&session, &locations, 30, Utc::now());
        assert_eq!(
            sub_orders[0]
                .cook_location
                .as_ref()
                .map(|l| l.store_name.as_str()),
            Some("Umm Ali Kitchen")
        );
    }
}
