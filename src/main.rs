use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{signal, sync::mpsc};
use http::HeaderName;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use foodie_checkout as api;
use api::repositories::{CheckoutStore, SeaOrmCheckoutStore};
use api::services::collaborators::{
    Collaborators, InMemoryCookDirectory, InMemoryProductCatalog, SandboxPaymentGateway, VatTable,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);
    api::handlers::health::init_start_time();

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);
    let store: Arc<dyn CheckoutStore> = Arc::new(SeaOrmCheckoutStore::new(db_arc.clone()));

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    // Collaborators run in-process until the marketplace services are wired in
    let collaborators = Collaborators {
        cooks: Arc::new(InMemoryCookDirectory::new()),
        catalog: Arc::new(InMemoryProductCatalog::new()),
        payments: Arc::new(SandboxPaymentGateway::new()),
        vat: Arc::new(VatTable::from_config(&cfg.checkout.vat_rates)),
    };

    let services = api::handlers::AppServices::new(
        store,
        collaborators,
        Arc::new(event_sender),
        &cfg.checkout,
    );

    // Expired-session reaper
    let reaper = services.checkout.clone();
    let reaper_interval = cfg.checkout.reaper_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reaper_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = reaper.purge_expired(Utc::now()).await {
                warn!(error = %e, "Expired session sweep failed");
            }
        }
    });

    let state = api::AppState {
        db: Some(db_arc),
        services,
    };

    let cors_layer = if cfg.is_production() {
        CorsLayer::new()
    } else {
        CorsLayer::permissive()
    };

    let request_id_header = HeaderName::from_static("x-request-id");
    let app = api::app_router(state)
        .layer(TimeoutLayer::new(Duration::from_secs(cfg.request_timeout_secs)))
        .layer(cors_layer)
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid));

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("foodie-checkout listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("foodie-checkout stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
