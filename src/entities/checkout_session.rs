use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::SessionStatus;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkout_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: SessionStatus,
    pub version: i32,
    #[sea_orm(unique)]
    pub idempotency_key: Option<String>,
    pub expires_at: DateTimeUtc,
    #[sea_orm(column_type = "Json")]
    pub document: Json,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
