use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveEnum, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, Set, SqlErr, TransactionTrait,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{CheckoutStore, ConfirmationUnit, StoreError};
use crate::entities::{campaign, campaign_redemption, checkout_session, coupon, order};
use crate::models::{
    Campaign, CampaignStatus, CampaignType, CheckoutSession, Coupon, Order,
    SessionStatus,
};

/// Relational store. Unique indexes back coupon codes and idempotency keys;
/// session writes are guarded by the `version` column.
#[derive(Clone)]
pub struct SeaOrmCheckoutStore {
    db: Arc<DatabaseConnection>,
}

fn to_document<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn from_document<T: DeserializeOwned>(document: serde_json::Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(document)?)
}

/// Maps unique-constraint violations to `on_unique`, everything else to a database error.
fn unique_violation(err: DbErr, on_unique: impl FnOnce() -> StoreError) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => on_unique(),
        _ => StoreError::Database(err),
    }
}

fn session_from_model(model: checkout_session::Model) -> Result<CheckoutSession, StoreError> {
    let mut session: CheckoutSession = from_document(model.document)?;
    session.version = model.version;
    session.status = model.status;
    Ok(session)
}

fn coupon_from_model(model: coupon::Model) -> Coupon {
    Coupon {
        id: model.id,
        code: model.code,
        campaign_id: model.campaign_id,
        status: model.status,
        redemptions_count: model.redemptions_count,
    }
}

impl SeaOrmCheckoutStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Conditional write shared by plain updates and the confirmation transaction.
    async fn guarded_update<C: ConnectionTrait>(
        conn: &C,
        session: &CheckoutSession,
    ) -> Result<CheckoutSession, StoreError> {
        let mut stored = session.clone();
        stored.version = session.version + 1;
        let document = to_document(&stored)?;

        let result = checkout_session::Entity::update_many()
            .col_expr(
                checkout_session::Column::Status,
                Expr::value(stored.status.to_value()),
            )
            .col_expr(checkout_session::Column::Version, Expr::value(stored.version))
            .col_expr(
                checkout_session::Column::IdempotencyKey,
                Expr::value(stored.idempotency_key.clone()),
            )
            .col_expr(
                checkout_session::Column::ExpiresAt,
                Expr::value(stored.expires_at),
            )
            .col_expr(checkout_session::Column::Document, Expr::value(document))
            .col_expr(
                checkout_session::Column::UpdatedAt,
                Expr::value(stored.updated_at),
            )
            .filter(checkout_session::Column::Id.eq(session.id))
            .filter(checkout_session::Column::Version.eq(session.version))
            .exec(conn)
            .await
            .map_err(|e| unique_violation(e, || StoreError::DuplicateIdempotencyKey))?;

        if result.rows_affected == 0 {
            let exists = checkout_session::Entity::find_by_id(session.id)
                .one(conn)
                .await?
                .is_some();
            return Err(if exists {
                StoreError::VersionConflict(session.id)
            } else {
                StoreError::NotFound(format!("Checkout session {}", session.id))
            });
        }

        Ok(stored)
    }
}

#[async_trait]
impl CheckoutStore for SeaOrmCheckoutStore {
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    async fn insert_session(&self, session: &CheckoutSession) -> Result<(), StoreError> {
        let model = checkout_session::ActiveModel {
            id: Set(session.id),
            user_id: Set(session.user_id),
            status: Set(session.status),
            version: Set(session.version),
            idempotency_key: Set(session.idempotency_key.clone()),
            expires_at: Set(session.expires_at),
            document: Set(to_document(session)?),
            created_at: Set(session.created_at),
            updated_at: Set(session.updated_at),
        };
        checkout_session::Entity::insert(model)
            .exec_without_returning(&*self.db)
            .await
            .map_err(|e| {
                unique_violation(e, || {
                    StoreError::Duplicate(format!("Checkout session {}", session.id))
                })
            })?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<CheckoutSession>, StoreError> {
        checkout_session::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(session_from_model)
            .transpose()
    }

    #[instrument(skip(self, session), fields(session_id = %session.id, version = session.version))]
    async fn update_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<CheckoutSession, StoreError> {
        Self::guarded_update(&*self.db, session).await
    }

    async fn find_coupon_by_code(&self, code: &str) -> Result<Option<Coupon>, StoreError> {
        Ok(coupon::Entity::find()
            .filter(coupon::Column::Code.eq(code))
            .one(&*self.db)
            .await?
            .map(coupon_from_model))
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        campaign::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(|model| from_document(model.document))
            .transpose()
    }

    async fn active_discount_campaigns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Campaign>, StoreError> {
        campaign::Entity::find()
            .filter(campaign::Column::CampaignType.eq(CampaignType::Discount.to_value()))
            .filter(campaign::Column::Status.eq(CampaignStatus::Active.to_value()))
            .filter(campaign::Column::StartAt.lte(now))
            .filter(campaign::Column::EndAt.gte(now))
            .all(&*self.db)
            .await?
            .into_iter()
            .map(|model| from_document(model.document))
            .collect()
    }

    async fn count_redemptions(&self, campaign_id: Uuid, user_id: Uuid) -> Result<u64, StoreError> {
        Ok(campaign_redemption::Entity::find()
            .filter(campaign_redemption::Column::CampaignId.eq(campaign_id))
            .filter(campaign_redemption::Column::UserId.eq(user_id))
            .count(&*self.db)
            .await?)
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        order::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .map(|model| from_document(model.document))
            .transpose()
    }

    async fn find_order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>, StoreError> {
        order::Entity::find()
            .filter(order::Column::IdempotencyKey.eq(key))
            .one(&*self.db)
            .await?
            .map(|model| from_document(model.document))
            .transpose()
    }

    #[instrument(skip(self, unit), fields(session_id = %unit.session.id, order_id = %unit.order.id))]
    async fn commit_confirmation(
        &self,
        unit: ConfirmationUnit,
    ) -> Result<CheckoutSession, StoreError> {
        let txn = self.db.begin().await?;

        let stored = Self::guarded_update(&txn, &unit.session).await?;

        let order_model = order::ActiveModel {
            id: Set(unit.order.id),
            user_id: Set(unit.order.user_id),
            checkout_session_id: Set(unit.order.checkout_session_id),
            idempotency_key: Set(unit.order.idempotency_key.clone()),
            document: Set(to_document(&unit.order)?),
            created_at: Set(unit.order.created_at),
        };
        order::Entity::insert(order_model)
            .exec_without_returning(&txn)
            .await
            .map_err(|e| unique_violation(e, || StoreError::DuplicateIdempotencyKey))?;

        for redemption in &unit.redemptions {
            let model = campaign_redemption::ActiveModel {
                id: Set(redemption.id),
                campaign_id: Set(redemption.campaign_id),
                coupon_id: Set(redemption.coupon_id),
                user_id: Set(redemption.user_id),
                order_id: Set(redemption.order_id),
                checkout_session_id: Set(redemption.checkout_session_id),
                document: Set(to_document(redemption)?),
                created_at: Set(redemption.created_at),
            };
            campaign_redemption::Entity::insert(model)
                .exec_without_returning(&txn)
                .await?;
        }

        if let Some(coupon_id) = unit.coupon_id {
            let result = coupon::Entity::update_many()
                .col_expr(
                    coupon::Column::RedemptionsCount,
                    Expr::col(coupon::Column::RedemptionsCount).add(1),
                )
                .filter(coupon::Column::Id.eq(coupon_id))
                .exec(&txn)
                .await?;
            if result.rows_affected == 0 {
                return Err(StoreError::NotFound(format!("Coupon {}", coupon_id)));
            }
        }

        txn.commit().await?;
        debug!("Confirmation committed");
        Ok(stored)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = checkout_session::Entity::delete_many()
            .filter(checkout_session::Column::ExpiresAt.lte(now))
            .filter(checkout_session::Column::Status.ne(SessionStatus::Confirmed.to_value()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn upsert_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        let model = campaign::ActiveModel {
            id: Set(campaign.id),
            name: Set(campaign.name.clone()),
            campaign_type: Set(campaign.campaign_type),
            status: Set(campaign.status),
            start_at: Set(campaign.start_at),
            end_at: Set(campaign.end_at),
            document: Set(to_document(campaign)?),
            updated_at: Set(Utc::now()),
        };
        campaign::Entity::insert(model)
            .on_conflict(
                OnConflict::column(campaign::Column::Id)
                    .update_columns([
                        campaign::Column::Name,
                        campaign::Column::CampaignType,
                        campaign::Column::Status,
                        campaign::Column::StartAt,
                        campaign::Column::EndAt,
                        campaign::Column::Document,
                        campaign::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    async fn upsert_coupon(&self, coupon: &Coupon) -> Result<(), StoreError> {
        let code = Coupon::normalize_code(&coupon.code);
        let model = coupon::ActiveModel {
            id: Set(coupon.id),
            code: Set(code.clone()),
            campaign_id: Set(coupon.campaign_id),
            status: Set(coupon.status),
            redemptions_count: Set(coupon.redemptions_count),
        };
        coupon::Entity::insert(model)
            .on_conflict(
                OnConflict::column(coupon::Column::Id)
                    .update_columns([
                        coupon::Column::Code,
                        coupon::Column::CampaignId,
                        coupon::Column::Status,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await
            .map_err(|e| unique_violation(e, || StoreError::Duplicate(format!("Coupon code {}", code))))?;
        Ok(())
    }
}

