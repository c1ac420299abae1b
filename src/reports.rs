use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use tower_sessions::Session;

use crate::AppState;
use crate::analytics::{build_report, month_stats, scheduled_totals};
use crate::auth::{current_account, resolve_plan};
use crate::billing::BillingIdentity;
use crate::constants::*;
use crate::models::{DashboardQuery, DashboardSummary, ReportSummary, ResourceType};
use crate::subscription::CheckoutOutcome;
use crate::transactions::{load_user_transactions, recent_transactions};
use crate::usage::check_weekly_limit;

pub async fn get_reports(
    State(app_state): State<AppState>,
    session: Session,
) -> Result<(StatusCode, Json<ReportSummary>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    let plan = resolve_plan(&app_state, &user).await;

    let transactions = load_user_transactions(&app_state.db, &user.id).await?;
    let report = build_report(&transactions, app_state.clock.now().date(), plan);

    Ok((StatusCode::OK, Json(report)))
}

/// Dashboard summary. A `?checkout=` marker left by the payment page is
/// consumed here: the browser is sent back to the bare path and, after a
/// successful checkout, a delayed subscription refresh is scheduled.
pub async fn get_dashboard(
    State(app_state): State<AppState>,
    session: Session,
    Query(query): Query<DashboardQuery>,
) -> Result<Response, (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;

    if let Some(marker) = query.checkout.as_deref() {
        if let Some(outcome) = CheckoutOutcome::parse(marker) {
            tracing::info!(user_id = %user.id, ?outcome, "returned from checkout");
            app_state
                .subscriptions
                .checkout_returned(&BillingIdentity::from(&user), outcome)
                .await;
        }
        return Ok(Redirect::to("/dashboard").into_response());
    }

    let today = app_state.clock.now().date();
    let plan = resolve_plan(&app_state, &user).await;

    let transactions = load_user_transactions(&app_state.db, &user.id).await?;
    let stats = month_stats(&transactions, today);
    let (accounts_receivable, accounts_payable) = scheduled_totals(&transactions, today);
    let recent =
        recent_transactions(&app_state.db, &user.id, DASHBOARD_RECENT_TRANSACTIONS).await?;
    let weekly_limit = check_weekly_limit(
        &app_state.db,
        &user.id,
        ResourceType::Transactions,
        plan,
        app_state.clock.unix_now(),
    )
    .await?;

    let summary = DashboardSummary {
        total_income: stats.total_income,
        total_expense: stats.total_expense,
        balance: stats.total_profit,
        recent_transactions: recent,
        weekly_limit,
        accounts_receivable,
        accounts_payable,
    };

    Ok((StatusCode::OK, Json(summary)).into_response())
}
