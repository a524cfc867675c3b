mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::{address_at, campaign, cart_request, delivery_line, north_of, RIYADH};
use foodie_checkout::{
    config::CheckoutSettings,
    db::{establish_connection_with_config, run_migrations, DbConfig},
    events::EventSender,
    handlers::AppServices,
    models::{
        CampaignRedemption, CampaignType, CheckoutSession, CookLocation, Coupon, CouponStatus,
        DishSnapshot, Order, PaymentMethod, PaymentStatus, PricingBreakdown, SessionStatus,
        VatSnapshot,
    },
    repositories::{CheckoutStore, ConfirmationUnit, SeaOrmCheckoutStore, StoreError},
    services::collaborators::{
        Collaborators, InMemoryCookDirectory, InMemoryProductCatalog, SandboxPaymentGateway,
        VatTable,
    },
};
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use uuid::Uuid;

async fn sqlite_store() -> SeaOrmCheckoutStore {
    // One connection keeps every query on the same in-memory database.
    let config = DbConfig {
        url: "sqlite::memory:".to_string(),
        max_connections: 1,
        min_connections: 1,
        connect_timeout: std::time::Duration::from_secs(5),
        idle_timeout: std::time::Duration::from_secs(60),
    };
    let db = establish_connection_with_config(&config)
        .await
        .expect("sqlite connection");
    run_migrations(&db).await.expect("migrations");
    SeaOrmCheckoutStore::new(Arc::new(db))
}

fn session() -> CheckoutSession {
    let now = Utc::now();
    CheckoutSession {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        status: SessionStatus::Priced,
        country_code: "SA".to_string(),
        cart: vec![],
        cook_preferences: vec![],
        address: None,
        pricing: PricingBreakdown::default(),
        auto_discounts: vec![],
        applied_coupon: None,
        payment_method: PaymentMethod::Cash,
        payment_status: PaymentStatus::Unpaid,
        payment_intent_id: None,
        payment_amount: None,
        idempotency_key: None,
        order_id: None,
        messages: vec![],
        failure: None,
        version: 0,
        created_at: now,
        updated_at: now,
        expires_at: now + Duration::hours(2),
    }
}

fn order_for(session: &CheckoutSession, key: &str) -> Order {
    Order {
        id: Uuid::new_v4(),
        user_id: session.user_id,
        checkout_session_id: session.id,
        idempotency_key: key.to_string(),
        sub_orders: vec![],
        delivery_address: None,
        pricing: PricingBreakdown::default(),
        vat_snapshot: VatSnapshot::from(&PricingBreakdown::default()),
        applied_coupon: None,
        payment_method: PaymentMethod::Cash,
        payment_status: PaymentStatus::Unpaid,
        payment_intent_id: None,
        created_at: Utc::now(),
    }
}

fn confirmed(session: &CheckoutSession, key: &str, order: &Order) -> CheckoutSession {
    let mut confirmed = session.clone();
    confirmed.status = SessionStatus::Confirmed;
    confirmed.idempotency_key = Some(key.to_string());
    confirmed.order_id = Some(order.id);
    confirmed
}

#[tokio::test]
async fn session_round_trips_and_bumps_version() {
    let store = sqlite_store().await;
    let original = session();
    store.insert_session(&original).await.unwrap();

    let loaded = store.get_session(original.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, original.id);
    assert_eq!(loaded.version, 0);
    assert_eq!(loaded.status, SessionStatus::Priced);

    let mut changed = loaded.clone();
    changed.payment_method = PaymentMethod::Card;
    let stored = store.update_session(&changed).await.unwrap();
    assert_eq!(stored.version, 1);

    let reloaded = store.get_session(original.id).await.unwrap().unwrap();
    assert_eq!(reloaded.version, 1);
    assert_eq!(reloaded.payment_method, PaymentMethod::Card);
}

#[tokio::test]
async fn stale_write_is_a_version_conflict() {
    let store = sqlite_store().await;
    let original = session();
    store.insert_session(&original).await.unwrap();
    store.update_session(&original).await.unwrap();

    let err = store.update_session(&original).await.unwrap_err();
    assert_matches!(err, StoreError::VersionConflict(id) if id == original.id);

    let missing = session();
    let err = store.update_session(&missing).await.unwrap_err();
    assert_matches!(err, StoreError::NotFound(_));
}

#[tokio::test]
async fn commit_confirmation_writes_everything() {
    let store = sqlite_store().await;
    let promo = campaign(CampaignType::Coupon, dec!(10), None, dec!(0));
    store.upsert_campaign(&promo).await.unwrap();
    let coupon = Coupon {
        id: Uuid::new_v4(),
        code: "welcome".to_string(),
        campaign_id: promo.id,
        status: CouponStatus::Active,
        redemptions_count: 0,
    };
    store.upsert_coupon(&coupon).await.unwrap();

    let original = session();
    store.insert_session(&original).await.unwrap();
    let order = order_for(&original, "hash-1");
    let redemption = CampaignRedemption {
        id: Uuid::new_v4(),
        campaign_id: promo.id,
        coupon_id: Some(coupon.id),
        user_id: original.user_id,
        order_id: order.id,
        checkout_session_id: original.id,
        discount_amount: dec!(5),
        created_at: Utc::now(),
    };

    let stored = store
        .commit_confirmation(ConfirmationUnit {
            session: confirmed(&original, "hash-1", &order),
            order: order.clone(),
            redemptions: vec![redemption],
            coupon_id: Some(coupon.id),
        })
        .await
        .unwrap();
    assert_eq!(stored.status, SessionStatus::Confirmed);
    assert_eq!(stored.version, 1);

    let found = store
        .find_order_by_idempotency_key("hash-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, order.id);
    assert!(store.get_order(order.id).await.unwrap().is_some());
    assert_eq!(
        store
            .count_redemptions(promo.id, original.user_id)
            .await
            .unwrap(),
        1
    );
    let coupon = store.find_coupon_by_code("WELCOME").await.unwrap().unwrap();
    assert_eq!(coupon.redemptions_count, 1);
}

#[tokio::test]
async fn failed_confirmation_leaves_no_trace() {
    let store = sqlite_store().await;
    let first = session();
    let second = session();
    store.insert_session(&first).await.unwrap();
    store.insert_session(&second).await.unwrap();

    let order = order_for(&first, "hash-shared");
    store
        .commit_confirmation(ConfirmationUnit {
            session: confirmed(&first, "hash-shared", &order),
            order,
            redemptions: vec![],
            coupon_id: None,
        })
        .await
        .unwrap();

    // Reusing the key from another session trips the unique index mid-transaction.
    let order = order_for(&second, "hash-shared");
    let promo = campaign(CampaignType::Discount, dec!(10), None, dec!(0));
    let redemption = CampaignRedemption {
        id: Uuid::new_v4(),
        campaign_id: promo.id,
        coupon_id: None,
        user_id: second.user_id,
        order_id: order.id,
        checkout_session_id: second.id,
        discount_amount: dec!(3),
        created_at: Utc::now(),
    };
    let err = store
        .commit_confirmation(ConfirmationUnit {
            session: confirmed(&second, "hash-shared", &order),
            order,
            redemptions: vec![redemption],
            coupon_id: None,
        })
        .await
        .unwrap_err();
    assert_matches!(err, StoreError::DuplicateIdempotencyKey);

    let untouched = store.get_session(second.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, SessionStatus::Priced);
    assert_eq!(untouched.version, 0);
    assert_eq!(
        store
            .count_redemptions(promo.id, second.user_id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn missing_coupon_rolls_back_confirmation() {
    let store = sqlite_store().await;
    let original = session();
    store.insert_session(&original).await.unwrap();

    let order = order_for(&original, "hash-ghost");
    let err = store
        .commit_confirmation(ConfirmationUnit {
            session: confirmed(&original, "hash-ghost", &order),
            order,
            redemptions: vec![],
            coupon_id: Some(Uuid::new_v4()),
        })
        .await
        .unwrap_err();
    assert_matches!(err, StoreError::NotFound(_));

    assert!(store
        .find_order_by_idempotency_key("hash-ghost")
        .await
        .unwrap()
        .is_none());
    let session = store.get_session(original.id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Priced);
}

#[tokio::test]
async fn purge_removes_only_expired_unconfirmed_sessions() {
    let store = sqlite_store().await;
    let now = Utc::now();

    let mut expired = session();
    expired.expires_at = now - Duration::minutes(5);
    let fresh = session();
    let mut done = session();
    done.expires_at = now - Duration::minutes(5);
    for s in [&expired, &fresh, &done] {
        store.insert_session(s).await.unwrap();
    }
    let order = order_for(&done, "hash-done");
    store
        .commit_confirmation(ConfirmationUnit {
            session: confirmed(&done, "hash-done", &order),
            order,
            redemptions: vec![],
            coupon_id: None,
        })
        .await
        .unwrap();

    assert_eq!(store.purge_expired(now).await.unwrap(), 1);
    assert!(store.get_session(expired.id).await.unwrap().is_none());
    assert!(store.get_session(fresh.id).await.unwrap().is_some());
    assert!(store.get_session(done.id).await.unwrap().is_some());
}

#[tokio::test]
async fn coupon_codes_are_unique_and_normalized() {
    let store = sqlite_store().await;
    let promo = campaign(CampaignType::Coupon, dec!(10), None, dec!(0));
    store.upsert_campaign(&promo).await.unwrap();

    let coupon = Coupon {
        id: Uuid::new_v4(),
        code: " ramadan ".to_string(),
        campaign_id: promo.id,
        status: CouponStatus::Active,
        redemptions_count: 0,
    };
    store.upsert_coupon(&coupon).await.unwrap();
    // Upserting the same coupon again is fine.
    store.upsert_coupon(&coupon).await.unwrap();

    let clash = Coupon {
        id: Uuid::new_v4(),
        ..coupon.clone()
    };
    let err = store.upsert_coupon(&clash).await.unwrap_err();
    assert_matches!(err, StoreError::Duplicate(_));

    let found = store.find_coupon_by_code("RAMADAN").await.unwrap().unwrap();
    assert_eq!(found.id, coupon.id);
    assert_eq!(found.campaign_id, promo.id);
}

#[tokio::test]
async fn active_discount_campaigns_filters_by_window_and_type() {
    let store = sqlite_store().await;
    let now = Utc::now();

    let live = campaign(CampaignType::Discount, dec!(10), None, dec!(0));
    let mut future = campaign(CampaignType::Discount, dec!(10), None, dec!(0));
    future.start_at = now + Duration::days(2);
    let coupon_only = campaign(CampaignType::Coupon, dec!(10), None, dec!(0));
    for c in [&live, &future, &coupon_only] {
        store.upsert_campaign(c).await.unwrap();
    }

    let active = store.active_discount_campaigns(now).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, live.id);
}

#[tokio::test]
async fn checkout_confirms_end_to_end_on_sqlite() {
    let store = Arc::new(sqlite_store().await);
    let cooks = Arc::new(InMemoryCookDirectory::new());
    let catalog = Arc::new(InMemoryProductCatalog::new());
    let settings = CheckoutSettings::default();

    let cook = Uuid::new_v4();
    let kitchen = north_of(RIYADH, 1.5);
    cooks.insert(
        cook,
        CookLocation {
            lat: Some(kitchen.0),
            lng: Some(kitchen.1),
            city: "Riyadh".to_string(),
            store_name: "Umm Fahad".to_string(),
        },
    );
    let dish = Uuid::new_v4();
    catalog.insert(
        dish,
        DishSnapshot {
            name: "Margoog".to_string(),
            price: dec!(35),
            image: None,
            category_id: None,
        },
    );

    let (tx, _rx) = mpsc::channel(64);
    let services = AppServices::new(
        store.clone(),
        Collaborators {
            cooks,
            catalog,
            payments: Arc::new(SandboxPaymentGateway::new()),
            vat: Arc::new(VatTable::from_config(&settings.vat_rates)),
        },
        Arc::new(EventSender::new(tx)),
        &settings,
    );

    let user_id = Uuid::new_v4();
    let session = services
        .checkout
        .create_session(
            user_id,
            cart_request(vec![delivery_line(cook, dish, 2, dec!(12))], "SA"),
        )
        .await
        .unwrap();
    services
        .checkout
        .update_address(user_id, session.id, address_at(RIYADH, "Riyadh", "SA"))
        .await
        .unwrap();

    let order = services
        .confirmation
        .confirm(user_id, session.id, "sqlite-confirm-1")
        .await
        .unwrap();
    let replay = services
        .confirmation
        .confirm(user_id, session.id, "sqlite-confirm-1")
        .await
        .unwrap();
    assert_eq!(order.id, replay.id);
    assert_eq!(order.pricing.total, dec!(82.00));
    assert_eq!(order.sub_orders.len(), 1);

    let stored = store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Confirmed);
    assert_eq!(stored.order_id, Some(order.id));
}
