//! Foodie checkout engine
//!
//! Checkout sessions, pricing, geo validation and order confirmation for a
//! multi-cook food delivery marketplace, exposed over an axum HTTP API.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod models;
pub mod repositories;
pub mod services;

use axum::Router;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

// App state definition
#[derive(Clone)]
pub struct AppState {
    /// Absent when running over the in-memory store.
    pub db: Option<Arc<DatabaseConnection>>,
    pub services: handlers::AppServices,
}

impl AppState {
    pub fn checkout_service(&self) -> Arc<services::CheckoutService> {
        self.services.checkout.clone()
    }

    pub fn confirmation_service(&self) -> Arc<services::ConfirmationService> {
        self.services.confirmation.clone()
    }
}

/// Versioned API routes, mounted under `/api/v1`
pub fn api_v1_routes() -> Router<AppState> {
    Router::new().merge(handlers::checkout::checkout_routes())
}

/// Full application router without transport layers.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .merge(handlers::health::health_routes())
        .with_state(state)
}
