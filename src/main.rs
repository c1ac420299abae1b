use std::sync::Arc;

use time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::Key};
use tracing_subscriber::EnvFilter;

use saldus_server::{
    AppState,
    billing::{BillingBackend, StripeBilling, UnconfiguredBilling},
    clock::SystemClock,
    config::Config,
    constants::*,
    database,
    recovery::{LogMailer, RecoveryMailer, SmtpMailer},
    routes,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().map_err(|e| format!("Configuration error: {}", e))?;

    let db = database::init_db(&config.data_path)
        .await
        .map_err(|e| format!("Failed to initialize database: {}", e))?;

    let billing: Arc<dyn BillingBackend> = match &config.stripe {
        Some(stripe) => Arc::new(StripeBilling::new(reqwest::Client::new(), stripe)),
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set, subscriptions resolve to stored plans");
            Arc::new(UnconfiguredBilling)
        }
    };

    let mailer: Arc<dyn RecoveryMailer> = match &config.smtp {
        Some(smtp) => Arc::new(
            SmtpMailer::new(smtp, &config.frontend_origin)
                .map_err(|e| format!("Invalid SMTP configuration: {}", e))?,
        ),
        None => {
            tracing::warn!("SMTP_HOST not set, password reset links are only logged");
            Arc::new(LogMailer)
        }
    };

    let app_state = AppState::new(
        db,
        billing,
        mailer,
        Arc::new(SystemClock),
        config.frontend_origin.clone(),
    );

    app_state
        .subscriptions
        .spawn_poller(std::time::Duration::from_secs(SUBSCRIPTION_POLL_SECONDS));

    // TODO: swap MemoryStore for a persistent store so sessions survive restarts
    let store = MemoryStore::default();

    let session_key = Key::try_from(config.session_secret.as_bytes())
        .map_err(|e| format!("Invalid session secret: {}", e))?;

    let session_layer = SessionManagerLayer::new(store)
        .with_secure(config.production)
        .with_name(SESSION_NAME)
        .with_expiry(Expiry::OnInactivity(Duration::days(SESSION_EXPIRY_DAYS)))
        .with_signed(session_key);

    let frontend_origin_header = config
        .frontend_origin
        .parse::<axum::http::HeaderValue>()
        .map_err(|e| format!("Invalid FRONTEND_ORIGIN '{}': {}", config.frontend_origin, e))?;

    let cors = CorsLayer::new()
        .allow_origin(frontend_origin_header)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::header::COOKIE,
        ])
        .allow_credentials(true);

    let app = routes::router(app_state)
        .layer(cors)
        .layer(session_layer)
        .layer(TraceLayer::new_for_http());

    let bind_address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", bind_address, e))?;

    tracing::info!("Server running on http://{}", bind_address);

    axum::serve(listener, app)
        .await
        .map_err(|e| format!("Server error: {}", e))?;

    Ok(())
}
