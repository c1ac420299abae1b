pub mod analytics;
pub mod auth;
pub mod billing;
pub mod clients;
pub mod clock;
pub mod config;
pub mod constants;
pub mod database;
pub mod goals;
pub mod models;
pub mod recovery;
pub mod reports;
pub mod routes;
pub mod subscription;
pub mod transactions;
pub mod usage;
pub mod utils;

use std::sync::Arc;

// Re-export types at crate root for convenient importing
pub use crate::database::{Db, TransactionError, with_transaction};

use crate::billing::BillingBackend;
use crate::clock::Clock;
use crate::recovery::RecoveryMailer;
use crate::subscription::SubscriptionRegistry;

/// Application state shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    /// Cached subscription state per signed-in user
    pub subscriptions: SubscriptionRegistry,
    pub billing: Arc<dyn BillingBackend>,
    pub mailer: Arc<dyn RecoveryMailer>,
    pub clock: Arc<dyn Clock>,
    /// Fallback origin for billing redirect URLs
    pub frontend_origin: String,
}

impl AppState {
    pub fn new(
        db: Db,
        billing: Arc<dyn BillingBackend>,
        mailer: Arc<dyn RecoveryMailer>,
        clock: Arc<dyn Clock>,
        frontend_origin: String,
    ) -> Self {
        let subscriptions = SubscriptionRegistry::new(db.clone(), billing.clone(), clock.clone());
        Self {
            db,
            subscriptions,
            billing,
            mailer,
            clock,
            frontend_origin,
        }
    }
}
