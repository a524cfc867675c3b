pub mod checkout;
pub mod common;
pub mod health;

use std::sync::Arc;

use crate::config::CheckoutSettings;
use crate::events::EventSender;
use crate::repositories::CheckoutStore;
use crate::services::collaborators::Collaborators;
use crate::services::{
    CheckoutService, ConfirmationService, GeoGate, PricingEngine, PricingPolicy,
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub confirmation: Arc<ConfirmationService>,
}

impl AppServices {
    /// Wires the checkout services over one store and one set of collaborators.
    pub fn new(
        store: Arc<dyn CheckoutStore>,
        collaborators: Collaborators,
        event_sender: Arc<EventSender>,
        settings: &CheckoutSettings,
    ) -> Self {
        let pricing = Arc::new(PricingEngine::new(
            store.clone(),
            collaborators.vat.clone(),
            PricingPolicy::from(settings),
        ));
        let geo = Arc::new(GeoGate::new(
            collaborators.cooks.clone(),
            settings.max_delivery_radius_km,
        ));

        let checkout = Arc::new(CheckoutService::new(
            store.clone(),
            pricing.clone(),
            geo.clone(),
            collaborators.catalog.clone(),
            collaborators.payments.clone(),
            event_sender.clone(),
            settings.clone(),
        ));
        let confirmation = Arc::new(ConfirmationService::new(
            store,
            pricing,
            geo,
            collaborators.payments,
            event_sender,
            settings.clone(),
        ));

        Self {
            checkout,
            confirmation,
        }
    }
}
