use axum::{
    Router,
    routing::{get, post, put},
};

use crate::{
    AppState, auth, billing, clients, goals, recovery, reports, subscription, transactions,
};

/// All API routes. Session, CORS and tracing layers are added by the caller.
pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/me", get(auth::me))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/security", put(recovery::set_security_question))
        .route("/auth/recovery/question", post(recovery::recovery_question))
        .route("/auth/recovery/answer", post(recovery::recovery_answer))
        .route("/auth/reset-password", post(recovery::reset_password))
        .route(
            "/transactions",
            post(transactions::create_transaction).get(transactions::get_transactions),
        )
        .route("/transactions/limit", get(transactions::transaction_limit))
        .route(
            "/transactions/{id}",
            put(transactions::update_transaction).delete(transactions::delete_transaction),
        )
        .route(
            "/clients",
            post(clients::create_client).get(clients::get_clients),
        )
        .route("/clients/limit", get(clients::client_limit))
        .route(
            "/clients/{id}",
            put(clients::update_client).delete(clients::delete_client),
        )
        .route("/goals", get(goals::get_goals).post(goals::create_goal))
        .route("/goals/progress", get(goals::goals_progress))
        .route(
            "/goals/{id}",
            put(goals::update_goal).delete(goals::delete_goal),
        )
        .route("/reports", get(reports::get_reports))
        .route("/dashboard", get(reports::get_dashboard))
        .route("/subscription", get(subscription::get_subscription))
        .route(
            "/subscription/refresh",
            post(subscription::refresh_subscription),
        )
        .route("/billing/checkout", post(billing::create_checkout))
        .route("/billing/portal", post(billing::open_customer_portal))
        .with_state(app_state)
}
