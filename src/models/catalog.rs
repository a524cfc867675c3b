use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kitchen location as published by the cook directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookLocation {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub city: String,
    pub store_name: String,
}

/// Catalog view of a dish at the moment it is read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DishSnapshot {
    pub name: String,
    pub price: Decimal,
    pub image: Option<String>,
    pub category_id: Option<Uuid>,
}

/// Per-country tax configuration. Rates are percentages (15 means 15%).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatConfig {
    pub enabled: bool,
    pub rate: Decimal,
    pub label: String,
    pub currency_code: String,
}

impl VatConfig {
    pub fn disabled(currency_code: impl Into<String>) -> Self {
        Self {
            enabled: false,
            rate: Decimal::ZERO,
            label: "VAT".to_string(),
            currency_code: currency_code.into(),
        }
    }

    /// Rate actually applied; disabled configs contribute nothing.
    pub fn effective_rate(&self) -> Decimal {
        if self.enabled && self.rate > Decimal::ZERO {
            self.rate
        } else {
            Decimal::ZERO
        }
    }
}
