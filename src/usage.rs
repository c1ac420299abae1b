use axum::http::StatusCode;

use crate::Db;
use crate::constants::*;
use crate::models::{PlanType, ResourceType, WeeklyLimit};
use crate::utils::{db_error, db_error_with_context};

/// Quota decision for `count` creations in the current rolling window.
pub fn weekly_limit(plan: PlanType, count: u32) -> WeeklyLimit {
    match plan {
        PlanType::Pro => WeeklyLimit {
            count: 0,
            limit: None,
            can_create: true,
        },
        PlanType::Free => WeeklyLimit {
            count,
            limit: Some(FREE_WEEKLY_LIMIT),
            can_create: count < FREE_WEEKLY_LIMIT,
        },
    }
}

/// Start of the rolling window: `now - 7 * 24h`, wall clock.
pub fn window_start(now: i64) -> i64 {
    now - WEEKLY_WINDOW_SECONDS
}

pub async fn count_recent_creations(
    db: &Db,
    user_id: &str,
    resource: ResourceType,
    now: i64,
) -> Result<u32, (StatusCode, String)> {
    let conn = db.read().await;
    let query = format!(
        "SELECT COUNT(*) FROM {} WHERE user_id = ? AND created_at >= ?",
        resource.table()
    );

    let mut rows = conn
        .query(&query, (user_id, window_start(now)))
        .await
        .map_err(|_| db_error_with_context("failed to count recent creations"))?;

    let count: u32 = if let Some(row) = rows.next().await.map_err(|_| db_error())? {
        row.get(0).map_err(|_| db_error())?
    } else {
        0
    };

    Ok(count)
}

/// Pro plans never touch the store. For free plans a failed count is an error,
/// so callers refuse the creation instead of guessing.
pub async fn check_weekly_limit(
    db: &Db,
    user_id: &str,
    resource: ResourceType,
    plan: PlanType,
    now: i64,
) -> Result<WeeklyLimit, (StatusCode, String)> {
    if plan.is_pro() {
        return Ok(weekly_limit(plan, 0));
    }

    let count = count_recent_creations(db, user_id, resource, now).await?;
    Ok(weekly_limit(plan, count))
}

/// Gate used right before an insert.
pub async fn ensure_can_create(
    db: &Db,
    user_id: &str,
    resource: ResourceType,
    plan: PlanType,
    now: i64,
) -> Result<WeeklyLimit, (StatusCode, String)> {
    let limit = check_weekly_limit(db, user_id, resource, plan, now).await?;
    if !limit.can_create {
        tracing::info!(
            user_id,
            resource = resource.table(),
            count = limit.count,
            "weekly limit reached"
        );
        return Err((
            StatusCode::FORBIDDEN,
            format!(
                "You reached the free plan limit of {} new {} per week. Upgrade to Pro for unlimited {}.",
                FREE_WEEKLY_LIMIT,
                resource.table(),
                resource.table()
            ),
        ));
    }
    Ok(limit)
}
