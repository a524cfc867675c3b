use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::errors::{CheckoutErrorCode, ServiceError};
use crate::models::{AddressSnapshot, CartLine, CookLocation, Reference};
use crate::services::collaborators::CookDirectory;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Rejects missing, non-finite, out-of-range and the (0,0) "unset" sentinel.
pub fn is_valid_coordinate(lat: Option<f64>, lng: Option<f64>) -> bool {
    match (lat, lng) {
        (Some(lat), Some(lng)) => {
            lat.is_finite()
                && lng.is_finite()
                && lat.abs() <= 90.0
                && lng.abs() <= 180.0
                && !(lat == 0.0 && lng == 0.0)
        }
        _ => false,
    }
}

/// Great-circle distance in kilometres (Haversine).
pub fn distance_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

fn same_city(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn cook_location_invalid() -> ServiceError {
    ServiceError::rejected(
        CheckoutErrorCode::CookLocationInvalid,
        "One of the kitchens in your cart has no valid location",
    )
}

/// Checks a delivery address against the kitchens of every cook in the cart.
#[derive(Clone)]
pub struct GeoGate {
    cooks: Arc<dyn CookDirectory>,
    max_radius_km: f64,
}

impl GeoGate {
    pub fn new(cooks: Arc<dyn CookDirectory>, max_radius_km: f64) -> Self {
        Self {
            cooks,
            max_radius_km,
        }
    }

    /// Returns the verified kitchen locations, keyed by cook. Legacy cook
    /// references cannot be resolved and are skipped.
    #[instrument(skip(self, address, cart))]
    pub async fn validate(
        &self,
        address: &AddressSnapshot,
        cart: &[CartLine],
    ) -> Result<HashMap<Reference, CookLocation>, ServiceError> {
        let (lat, lng) = match (address.lat, address.lng) {
            (Some(lat), Some(lng)) if is_valid_coordinate(address.lat, address.lng) => (lat, lng),
            _ => {
                return Err(ServiceError::rejected(
                    CheckoutErrorCode::InvalidLocation,
                    "Please pick your delivery location on the map",
                ))
            }
        };

        let mut verified = HashMap::new();
        for line in cart {
            let cook_id = match line.cook_id.as_uuid() {
                Some(id) => id,
                None => {
                    debug!("Skipping geo check for legacy cook {}", line.cook_id);
                    continue;
                }
            };
            if verified.contains_key(&line.cook_id) {
                continue;
            }

            let location = self.cooks.get_cook_location(cook_id).await?;
            let (location, cook_lat, cook_lng) = match location {
                Some(location) => match (location.lat, location.lng) {
                    (Some(cook_lat), Some(cook_lng))
                        if is_valid_coordinate(location.lat, location.lng) =>
                    {
                        (location, cook_lat, cook_lng)
                    }
                    _ => return Err(cook_location_invalid()),
                },
                None => return Err(cook_location_invalid()),
            };

            if !same_city(&location.city, &address.city) {
                return Err(ServiceError::rejected(
                    CheckoutErrorCode::CityMismatch,
                    format!(
                        "{} only delivers within {}",
                        location.store_name, location.city
                    ),
                ));
            }

            let distance = distance_km(lat, lng, cook_lat, cook_lng);
            if distance > self.max_radius_km {
                return Err(ServiceError::rejected(
                    CheckoutErrorCode::DistanceExceeded,
                    format!(
                        "{} is {:.1} km away, beyond the {} km delivery radius",
                        location.store_name, distance, self.max_radius_km
                    ),
                ));
            }

            verified.insert(line.cook_id.clone(), location);
        }

        Ok(verified)
    }
}
