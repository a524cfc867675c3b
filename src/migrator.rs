use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_promotion_tables::Migration),
            Box::new(m20240301_000002_create_checkout_tables::Migration),
        ]
    }
}

mod m20240301_000001_create_promotion_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_promotion_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Campaigns::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Campaigns::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Campaigns::Name).string().not_null())
                        .col(ColumnDef::new(Campaigns::CampaignType).string_len(16).not_null())
                        .col(ColumnDef::new(Campaigns::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Campaigns::StartAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Campaigns::EndAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Campaigns::Document).json().not_null())
                        .col(
                            ColumnDef::new(Campaigns::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_campaigns_type_status")
                        .table(Campaigns::Table)
                        .col(Campaigns::CampaignType)
                        .col(Campaigns::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Coupons::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Coupons::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Coupons::Code).string_len(64).not_null())
                        .col(ColumnDef::new(Coupons::CampaignId).uuid().not_null())
                        .col(ColumnDef::new(Coupons::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Coupons::RedemptionsCount)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_coupons_code")
                        .table(Coupons::Table)
                        .col(Coupons::Code)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CampaignRedemptions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CampaignRedemptions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CampaignRedemptions::CampaignId).uuid().not_null())
                        .col(ColumnDef::new(CampaignRedemptions::CouponId).uuid().null())
                        .col(ColumnDef::new(CampaignRedemptions::UserId).uuid().not_null())
                        .col(ColumnDef::new(CampaignRedemptions::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(CampaignRedemptions::CheckoutSessionId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CampaignRedemptions::Document).json().not_null())
                        .col(
                            ColumnDef::new(CampaignRedemptions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_campaign_redemptions_campaign_user")
                        .table(CampaignRedemptions::Table)
                        .col(CampaignRedemptions::CampaignId)
                        .col(CampaignRedemptions::UserId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CampaignRedemptions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Coupons::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Campaigns::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Campaigns {
        Table,
        Id,
        Name,
        CampaignType,
        Status,
        StartAt,
        EndAt,
        Document,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Coupons {
        Table,
        Id,
        Code,
        CampaignId,
        Status,
        RedemptionsCount,
    }

    #[derive(DeriveIden)]
    enum CampaignRedemptions {
        Table,
        Id,
        CampaignId,
        CouponId,
        UserId,
        OrderId,
        CheckoutSessionId,
        Document,
        CreatedAt,
    }
}

mod m20240301_000002_create_checkout_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_checkout_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CheckoutSessions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CheckoutSessions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CheckoutSessions::UserId).uuid().not_null())
                        .col(ColumnDef::new(CheckoutSessions::Status).string_len(32).not_null())
                        .col(
                            ColumnDef::new(CheckoutSessions::Version)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(CheckoutSessions::IdempotencyKey).string().null())
                        .col(
                            ColumnDef::new(CheckoutSessions::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CheckoutSessions::Document).json().not_null())
                        .col(
                            ColumnDef::new(CheckoutSessions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // NULLs do not collide, so this only constrains confirmed sessions.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_sessions_idempotency_key")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::IdempotencyKey)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_sessions_expires_at")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::ExpiresAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::UserId).uuid().not_null())
                        .col(ColumnDef::new(Orders::CheckoutSessionId).uuid().not_null())
                        .col(ColumnDef::new(Orders::IdempotencyKey).string().not_null())
                        .col(ColumnDef::new(Orders::Document).json().not_null())
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_idempotency_key")
                        .table(Orders::Table)
                        .col(Orders::IdempotencyKey)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_checkout_session_id")
                        .table(Orders::Table)
                        .col(Orders::CheckoutSessionId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_id")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(CheckoutSessions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CheckoutSessions {
        Table,
        Id,
        UserId,
        Status,
        Version,
        IdempotencyKey,
        ExpiresAt,
        Document,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Orders {
        Table,
        Id,
        UserId,
        CheckoutSessionId,
        IdempotencyKey,
        Document,
        CreatedAt,
    }
}
