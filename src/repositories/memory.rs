use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CheckoutStore, ConfirmationUnit, StoreError};
use crate::models::{
    Campaign, CampaignRedemption, CampaignStatus, CampaignType, CheckoutSession, Coupon, Order,
    SessionStatus,
};

/// Process-local store. Every write runs under one async lock so the
/// conditional session write and the confirmation unit are atomic.
#[derive(Default)]
pub struct InMemoryCheckoutStore {
    sessions: DashMap<Uuid, CheckoutSession>,
    session_keys: DashMap<String, Uuid>,
    campaigns: DashMap<Uuid, Campaign>,
    coupons: DashMap<Uuid, Coupon>,
    coupon_codes: DashMap<String, Uuid>,
    redemptions: DashMap<Uuid, CampaignRedemption>,
    orders: DashMap<Uuid, Order>,
    order_keys: DashMap<String, Uuid>,
    write_lock: Mutex<()>,
}

impl InMemoryCheckoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn redemption_count(&self) -> usize {
        self.redemptions.len()
    }

    /// Deletes a campaign outright, leaving its coupons in place.
    pub fn remove_campaign(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns.remove(&id).map(|(_, campaign)| campaign)
    }

    fn check_version(&self, session: &CheckoutSession) -> Result<(), StoreError> {
        match self.sessions.get(&session.id) {
            Some(stored) if stored.version == session.version => Ok(()),
            Some(_) => Err(StoreError::VersionConflict(session.id)),
            None => Err(StoreError::NotFound(format!(
                "Checkout session {}",
                session.id
            ))),
        }
    }

    fn check_session_key(&self, session: &CheckoutSession) -> Result<(), StoreError> {
        if let Some(key) = &session.idempotency_key {
            if let Some(owner) = self.session_keys.get(key) {
                if *owner != session.id {
                    return Err(StoreError::DuplicateIdempotencyKey);
                }
            }
        }
        Ok(())
    }

    fn write_session(&self, session: &CheckoutSession) -> CheckoutSession {
        let mut stored = session.clone();
        stored.version += 1;
        if let Some(key) = &stored.idempotency_key {
            self.session_keys.insert(key.clone(), stored.id);
        }
        self.sessions.insert(stored.id, stored.clone());
        stored
    }
}

#[async_trait]
impl CheckoutStore for InMemoryCheckoutStore {
    async fn insert_session(&self, session: &CheckoutSession) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate(format!(
                "Checkout session {} already exists",
                session.id
            )));
        }
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<CheckoutSession>, StoreError> {
        Ok(self.sessions.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<CheckoutSession, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.check_version(session)?;
        self.check_session_key(session)?;
        Ok(self.write_session(session))
    }

    async fn find_coupon_by_code(&self, code: &str) -> Result<Option<Coupon>, StoreError> {
        let id = match self.coupon_codes.get(code) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.coupons.get(&id).map(|entry| entry.value().clone()))
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        Ok(self.campaigns.get(&id).map(|entry| entry.value().clone()))
    }

    async fn active_discount_campaigns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Campaign>, StoreError> {
        Ok(self
            .campaigns
            .iter()
            .filter(|entry| {
                let c = entry.value();
                c.campaign_type == CampaignType::Discount
                    && c.status == CampaignStatus::Active
                    && c.is_live(now)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn count_redemptions(&self, campaign_id: Uuid, user_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .redemptions
            .iter()
            .filter(|r| r.campaign_id == campaign_id && r.user_id == user_id)
            .count() as u64)
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, StoreError> {
        let id = match self.order_keys.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    async fn commit_confirmation(
        &self,
        unit: ConfirmationUnit,
    ) -> Result<CheckoutSession, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.check_version(&unit.session)?;
        self.check_session_key(&unit.session)?;
        if self.order_keys.contains_key(&unit.order.idempotency_key) {
            return Err(StoreError::DuplicateIdempotencyKey);
        }
        if let Some(coupon_id) = unit.coupon_id {
            if !self.coupons.contains_key(&coupon_id) {
                return Err(StoreError::NotFound(format!("Coupon {}", coupon_id)));
            }
        }

        // All checks passed; nothing below can fail.
        if let Some(coupon_id) = unit.coupon_id {
            if let Some(mut coupon) = self.coupons.get_mut(&coupon_id) {
                coupon.redemptions_count += 1;
            }
        }
        for redemption in unit.redemptions {
            self.redemptions.insert(redemption.id, redemption);
        }
        self.order_keys
            .insert(unit.order.idempotency_key.clone(), unit.order.id);
        self.orders.insert(unit.order.id, unit.order);
        Ok(self.write_session(&unit.session))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.status != SessionStatus::Confirmed && entry.expires_at <= now
            })
            .map(|entry| *entry.key())
            .collect();

        for id in &expired {
            if let Some((_, session)) = self.sessions.remove(id) {
                if let Some(key) = session.idempotency_key {
                    self.session_keys.remove(&key);
                }
            }
        }
        Ok(expired.len() as u64)
    }

    async fn upsert_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn upsert_coupon(&self, coupon: &Coupon) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let code = Coupon::normalize_code(&coupon.code);
        if let Some(owner) = self.coupon_codes.get(&code) {
            if *owner != coupon.id {
                return Err(StoreError::Duplicate(format!("Coupon code {}", code)));
            }
        }
        if let Some(previous) = self.coupons.get(&coupon.id) {
            if previous.code != code {
                self.coupon_codes.remove(&previous.code);
            }
        }
        let mut stored = coupon.clone();
        stored.code = code.clone();
        self.coupon_codes.insert(code, stored.id);
        self.coupons.insert(stored.id, stored);
        Ok(())
    }
}
