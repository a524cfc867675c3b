//! Persistence boundary for checkout sessions, promotions and orders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use uuid::Uuid;

use crate::models::{Campaign, CampaignRedemption, CheckoutSession, Coupon, Order};

pub mod database;
pub mod memory;

pub use database::SeaOrmCheckoutStore;
pub use memory::InMemoryCheckoutStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Conditional write lost against a concurrent writer.
    #[error("Version conflict on checkout session {0}")]
    VersionConflict(Uuid),

    #[error("Idempotency key already used")]
    DuplicateIdempotencyKey,

    #[error("Not found: {0}")]
    NotFound(String),

    /// A unique constraint other than the idempotency key was violated.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Everything written when a session is confirmed. Stores apply it atomically:
/// either the session, order, redemptions and coupon counter all change, or none do.
#[derive(Debug, Clone)]
pub struct ConfirmationUnit {
    /// Confirmed session; its `version` is the version that was read.
    pub session: CheckoutSession,
    pub order: Order,
    pub redemptions: Vec<CampaignRedemption>,
    /// Coupon whose redemption counter is incremented.
    pub coupon_id: Option<Uuid>,
}

#[async_trait]
pub trait CheckoutStore: Send + Sync {
    async fn insert_session(&self, session: &CheckoutSession) -> Result<(), StoreError>;

    /// Raw read; expiry is judged by the caller.
    async fn get_session(&self, id: Uuid) -> Result<Option<CheckoutSession>, StoreError>;

    /// Writes `session` if the stored version still equals `session.version`,
    /// returning the stored copy with the bumped version.
    async fn update_session(&self, session: &CheckoutSession)
        -> Result<CheckoutSession, StoreError>;

    async fn find_coupon_by_code(&self, code: &str) -> Result<Option<Coupon>, StoreError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError>;

    /// Active DISCOUNT campaigns whose window contains `now`.
    async fn active_discount_campaigns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Campaign>, StoreError>;

    async fn count_redemptions(&self, campaign_id: Uuid, user_id: Uuid) -> Result<u64, StoreError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn find_order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, StoreError>;

    /// Applies a [`ConfirmationUnit`] as one transaction, returning the stored session.
    async fn commit_confirmation(
        &self,
        unit: ConfirmationUnit,
    ) -> Result<CheckoutSession, StoreError>;

    /// Deletes unconfirmed sessions whose `expires_at` has passed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn upsert_campaign(&self, campaign: &Campaign) -> Result<(), StoreError>;

    async fn upsert_coupon(&self, coupon: &Coupon) -> Result<(), StoreError>;
}
