//! Outbound ports used by checkout: the cook directory, the dish catalog, the
//! payment gateway and per-country VAT settings. Each comes with an in-process
//! implementation used by the development server and the test-suite.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::VatRateConfig;
use crate::errors::ServiceError;
use crate::models::{CookLocation, DishSnapshot, VatConfig};

#[async_trait]
pub trait CookDirectory: Send + Sync {
    async fn get_cook_location(&self, cook_id: Uuid) -> Result<Option<CookLocation>, ServiceError>;
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn get_dish(&self, dish_id: Uuid) -> Result<Option<DishSnapshot>, ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
    pub amount: Decimal,
    pub currency: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        session_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentIntent, ServiceError>;

    /// Whether the gateway has captured funds for the intent.
    async fn is_paid(&self, intent_id: &str) -> Result<bool, ServiceError>;
}

#[async_trait]
pub trait VatSettings: Send + Sync {
    async fn vat_config(&self, country_code: &str) -> Result<Option<VatConfig>, ServiceError>;
}

/// Cook directory backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryCookDirectory {
    cooks: DashMap<Uuid, CookLocation>,
}

impl InMemoryCookDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cook_id: Uuid, location: CookLocation) {
        self.cooks.insert(cook_id, location);
    }
}

#[async_trait]
impl CookDirectory for InMemoryCookDirectory {
    async fn get_cook_location(&self, cook_id: Uuid) -> Result<Option<CookLocation>, ServiceError> {
        Ok(self.cooks.get(&cook_id).map(|entry| entry.value().clone()))
    }
}

#[derive(Default)]
pub struct InMemoryProductCatalog {
    dishes: DashMap<Uuid, DishSnapshot>,
}

impl InMemoryProductCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dish_id: Uuid, dish: DishSnapshot) {
        self.dishes.insert(dish_id, dish);
    }
}

#[async_trait]
impl ProductCatalog for InMemoryProductCatalog {
    async fn get_dish(&self, dish_id: Uuid) -> Result<Option<DishSnapshot>, ServiceError> {
        Ok(self.dishes.get(&dish_id).map(|entry| entry.value().clone()))
    }
}

/// The outbound ports checkout depends on, wired once at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub cooks: Arc<dyn CookDirectory>,
    pub catalog: Arc<dyn ProductCatalog>,
    pub payments: Arc<dyn PaymentGateway>,
    pub vat: Arc<dyn VatSettings>,
}

/// Gateway that issues intents locally; payments are marked paid explicitly.
#[derive(Default)]
pub struct SandboxPaymentGateway {
    intents: DashMap<String, bool>,
}

impl SandboxPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_paid(&self, intent_id: &str) -> Result<(), ServiceError> {
        match self.intents.get_mut(intent_id) {
            Some(mut paid) => {
                *paid = true;
                Ok(())
            }
            None => Err(ServiceError::NotFound(format!(
                "Payment intent {} not found",
                intent_id
            ))),
        }
    }
}

#[async_trait]
impl PaymentGateway for SandboxPaymentGateway {
    async fn create_payment_intent(
        &self,
        session_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::InvalidOperation(
                "Payment amount must be positive".to_string(),
            ));
        }
        let id = format!("pi_{}", Uuid::new_v4().simple());
        self.intents.insert(id.clone(), false);
        Ok(PaymentIntent {
            client_secret: format!("{}_secret_{}", id, session_id.simple()),
            id,
            amount,
            currency: currency.to_string(),
        })
    }

    async fn is_paid(&self, intent_id: &str) -> Result<bool, ServiceError> {
        Ok(self
            .intents
            .get(intent_id)
            .map(|entry| *entry.value())
            .unwrap_or(false))
    }
}

/// VAT settings loaded from configuration, keyed by upper-case country code.
#[derive(Debug, Clone, Default)]
pub struct VatTable {
    rates: HashMap<String, VatConfig>,
}

impl VatTable {
    pub fn from_config(entries: &[VatRateConfig]) -> Self {
        let rates = entries
            .iter()
            .map(|entry| {
                (
                    entry.country_code.trim().to_uppercase(),
                    VatConfig {
                        enabled: entry.enabled,
                        rate: entry.rate,
                        label: entry.label.clone(),
                        currency_code: entry.currency_code.clone(),
                    },
                )
            })
            .collect();
        Self { rates }
    }
}

#[async_trait]
impl VatSettings for VatTable {
    async fn vat_config(&self, country_code: &str) -> Result<Option<VatConfig>, ServiceError> {
        Ok(self.rates.get(&country_code.trim().to_uppercase()).cloned())
    }
}
