#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use foodie_checkout::{
    config::{AppConfig, CheckoutSettings},
    events::{self, EventSender},
    handlers::AppServices,
    models::{
        AddressSnapshot, Campaign, CampaignScope, CampaignStatus, CampaignType, CookLocation,
        Coupon, CouponStatus, DishSnapshot, FulfillmentMode, Reference,
    },
    repositories::{CheckoutStore, InMemoryCheckoutStore},
    services::{
        collaborators::{
            Collaborators, InMemoryCookDirectory, InMemoryProductCatalog, SandboxPaymentGateway,
            VatTable,
        },
        CartLineInput, CheckoutService, ConfirmationService, CreateSessionRequest,
    },
    AppState,
};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const RIYADH: (f64, f64) = (24.7136, 46.6753);

/// Point `km` kilometres due north of `origin`.
pub fn north_of(origin: (f64, f64), km: f64) -> (f64, f64) {
    (origin.0 + km / 111.195, origin.1)
}

/// Helper harness wiring the checkout services over the in-memory store and collaborators.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryCheckoutStore>,
    pub cooks: Arc<InMemoryCookDirectory>,
    pub catalog: Arc<InMemoryProductCatalog>,
    pub payments: Arc<SandboxPaymentGateway>,
    pub user_id: Uuid,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_settings(CheckoutSettings::default()).await
    }

    pub async fn with_settings(settings: CheckoutSettings) -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.checkout = settings;

        let store = Arc::new(InMemoryCheckoutStore::new());
        let cooks = Arc::new(InMemoryCookDirectory::new());
        let catalog = Arc::new(InMemoryProductCatalog::new());
        let payments = Arc::new(SandboxPaymentGateway::new());

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let services = AppServices::new(
            store.clone() as Arc<dyn CheckoutStore>,
            Collaborators {
                cooks: cooks.clone(),
                catalog: catalog.clone(),
                payments: payments.clone(),
                vat: Arc::new(VatTable::from_config(&cfg.checkout.vat_rates)),
            },
            Arc::new(event_sender),
            &cfg.checkout,
        );

        let state = AppState {
            db: None,
            services,
        };

        Self {
            router: foodie_checkout::app_router(state.clone()),
            state,
            store,
            cooks,
            catalog,
            payments,
            user_id: Uuid::new_v4(),
            _event_task: event_task,
        }
    }

    pub fn checkout(&self) -> Arc<CheckoutService> {
        self.state.checkout_service()
    }

    pub fn confirmation(&self) -> Arc<ConfirmationService> {
        self.state.confirmation_service()
    }

    /// Sends a request as the harness user.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let user_id = self.user_id.to_string();
        let mut all_headers = vec![("X-User-Id", user_id.as_str())];
        all_headers.extend_from_slice(headers);
        self.request_with_headers(method, uri, body, &all_headers)
            .await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request builds");

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router responds")
    }

    pub fn seed_cook(&self, city: &str, at: (f64, f64)) -> Uuid {
        let cook_id = Uuid::new_v4();
        self.cooks.insert(
            cook_id,
            CookLocation {
                lat: Some(at.0),
                lng: Some(at.1),
                city: city.to_string(),
                store_name: format!("Kitchen {}", &cook_id.to_string()[..8]),
            },
        );
        cook_id
    }

    pub fn seed_dish(&self, name: &str, price: Decimal) -> Uuid {
        let dish_id = Uuid::new_v4();
        self.catalog.insert(
            dish_id,
            DishSnapshot {
                name: name.to_string(),
                price,
                image: None,
                category_id: None,
            },
        );
        dish_id
    }

    /// Active coupon campaign with the given percent, cap and minimum order.
    pub async fn seed_coupon(
        &self,
        code: &str,
        percent: Decimal,
        cap: Option<Decimal>,
        min_order: Decimal,
    ) -> (Campaign, Coupon) {
        let campaign = campaign(CampaignType::Coupon, percent, cap, min_order);
        let coupon = Coupon {
            id: Uuid::new_v4(),
            code: code.to_string(),
            campaign_id: campaign.id,
            status: CouponStatus::Active,
            redemptions_count: 0,
        };
        self.store
            .upsert_campaign(&campaign)
            .await
            .expect("seed campaign");
        self.store.upsert_coupon(&coupon).await.expect("seed coupon");
        (campaign, coupon)
    }

    pub async fn seed_discount(&self, percent: Decimal, cap: Option<Decimal>) -> Campaign {
        let campaign = campaign(CampaignType::Discount, percent, cap, Decimal::ZERO);
        self.store
            .upsert_campaign(&campaign)
            .await
            .expect("seed campaign");
        campaign
    }
}

pub fn campaign(
    campaign_type: CampaignType,
    percent: Decimal,
    cap: Option<Decimal>,
    min_order: Decimal,
) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: Uuid::new_v4(),
        name: format!("{:?} {}%", campaign_type, percent),
        campaign_type,
        status: CampaignStatus::Active,
        start_at: now - Duration::days(1),
        end_at: now + Duration::days(30),
        scope: CampaignScope::all(),
        discount_percent: percent,
        max_discount_amount: cap,
        min_order_value: min_order,
        max_redemptions_per_user: 1,
        country_code: None,
    }
}

pub fn address_at(at: (f64, f64), city: &str, country_code: &str) -> AddressSnapshot {
    AddressSnapshot {
        address_line1: "Olaya St 12".to_string(),
        address_line2: None,
        city: city.to_string(),
        country_code: country_code.to_string(),
        label: Some("Home".to_string()),
        delivery_notes: None,
        lat: Some(at.0),
        lng: Some(at.1),
    }
}

pub fn delivery_line(cook_id: Uuid, dish_id: Uuid, quantity: u32, fee: Decimal) -> CartLineInput {
    CartLineInput {
        cook_id: Reference::Id(cook_id),
        dish_id: Reference::Id(dish_id),
        dish_name: None,
        unit_price: None,
        quantity,
        fulfillment_mode: FulfillmentMode::Delivery,
        delivery_fee: fee,
        prep_ready: None,
        notes: None,
        category_id: None,
        image: None,
    }
}

pub fn cart_request(lines: Vec<CartLineInput>, country_code: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        lines,
        cook_preferences: Vec::new(),
        country_code: country_code.to_string(),
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
