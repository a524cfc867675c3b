// Checkout domain
pub mod checkout;
pub mod order;

// Promotions
pub mod campaign;

// Reference data read from collaborators
pub mod catalog;
pub mod reference;

pub use campaign::{
    Campaign, CampaignRedemption, CampaignScope, CampaignStatus, CampaignType, Coupon,
    CouponStatus,
};
pub use catalog::{CookLocation, DishSnapshot, VatConfig};
pub use checkout::{
    AddressSnapshot, AppliedCoupon, AppliedDiscount, CartLine, CheckoutSession, CookPreference,
    FulfillmentMode, PaymentMethod, PaymentStatus, PricingBreakdown, ReadyTime, SessionMessage,
    SessionStatus, TimingPreference,
};
pub use order::{Order, OrderItem, SubOrder, VatSnapshot};
pub use reference::Reference;
