use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Domain events emitted after checkout state has been durably written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CheckoutStarted {
        session_id: Uuid,
        user_id: Uuid,
    },
    CouponApplied {
        session_id: Uuid,
        code: String,
        discount: Decimal,
    },
    PaymentRecorded {
        session_id: Uuid,
        intent_id: String,
        paid: bool,
    },
    CheckoutFailed {
        session_id: Uuid,
        code: String,
    },
    OrderConfirmed {
        session_id: Uuid,
        order_id: Uuid,
        user_id: Uuid,
        total: Decimal,
        cook_ids: Vec<String>,
        confirmed_at: DateTime<Utc>,
    },
    SessionsExpired {
        purged: u64,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::CheckoutStarted { .. } => "checkout_started",
            Event::CouponApplied { .. } => "coupon_applied",
            Event::PaymentRecorded { .. } => "payment_recorded",
            Event::CheckoutFailed { .. } => "checkout_failed",
            Event::OrderConfirmed { .. } => "order_confirmed",
            Event::SessionsExpired { .. } => "sessions_expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, waiting for channel capacity.
    /// Fire-and-forget send. A full or closed channel never fails the caller.
    pub fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.sender.try_send(event) {
            warn!(event = name, error = %e, "Dropping checkout event");
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        metrics::counter!("foodie_checkout.events", 1, "event" => event.name());
        match &event {
            Event::OrderConfirmed {
                session_id,
                order_id,
                total,
                cook_ids,
                ..
            } => {
                info!(
                    %session_id,
                    %order_id,
                    %total,
                    cooks = cook_ids.len(),
                    "Order confirmed"
                );
            }
            Event::CheckoutFailed { session_id, code } => {
                warn!(%session_id, code = %code, "Checkout failed");
            }
            Event::SessionsExpired { purged } => {
                info!(purged, "Expired checkout sessions purged");
            }
            other => debug!(event = ?other, "Checkout event"),
        }
    }

    info!("Event processing loop stopped");
}
