//! SeaORM entities backing [`crate::repositories::SeaOrmCheckoutStore`].
//!
//! Money-bearing aggregates are persisted as JSON documents; the columns next
//! to the document exist for filtering, uniqueness and the version guard.

pub mod campaign;
pub mod campaign_redemption;
pub mod checkout_session;
pub mod coupon;
pub mod order;
