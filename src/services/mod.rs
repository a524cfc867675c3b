// Pure building blocks
pub mod geo;
pub mod pricing;
pub mod scope;

// Ports to the rest of the marketplace
pub mod collaborators;

// Checkout workflow
pub mod checkout;
pub mod confirmation;

pub use checkout::{CheckoutService, CreateSessionRequest, CartLineInput, PaymentIntentResult};
pub use confirmation::ConfirmationService;
pub use geo::GeoGate;
pub use pricing::{PricingEngine, PricingPolicy};
