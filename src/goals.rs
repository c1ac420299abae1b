use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use time::{Date, OffsetDateTime};
use tower_sessions::Session;
use uuid::Uuid;

use crate::analytics::month_stats;
use crate::auth::{current_account, resolve_plan};
use crate::constants::*;
use crate::models::{
    CreateGoalPayload, Goal, GoalProgress, GoalStatus, GoalType, GoalsProgressResponse,
    MonthStats, UpdateGoalPayload, User,
};
use crate::transactions::load_user_transactions;
use crate::utils::{db_error, db_error_with_context, normalize_optional, validate_amount};
use crate::{AppState, Db};

/// Current-month actual the goal is measured against.
pub fn goal_current(goal: &Goal, stats: &MonthStats) -> f64 {
    match goal.goal_type {
        GoalType::Income => stats.total_income,
        GoalType::Profit => stats.total_profit,
        GoalType::Expense => match goal
            .category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            Some(category) => stats
                .expenses_by_category
                .get(category)
                .copied()
                .unwrap_or(0.0),
            None => stats.total_expense,
        },
    }
}

/// `current / target` as a percentage capped at 100. Zero for a non-positive target.
pub fn goal_percentage(current: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return 0.0;
    }
    (current / target * 100.0).min(100.0)
}

pub fn goal_status(goal_type: GoalType, percentage: f64) -> GoalStatus {
    match goal_type {
        // lower is better
        GoalType::Expense => {
            if percentage <= 50.0 {
                GoalStatus::Comfortable
            } else if percentage <= 85.0 {
                GoalStatus::WithinBudget
            } else if percentage < 100.0 {
                GoalStatus::NearLimit
            } else {
                GoalStatus::OverBudget
            }
        }
        GoalType::Income | GoalType::Profit => {
            if percentage >= 100.0 {
                GoalStatus::Met
            } else if percentage >= 50.0 {
                GoalStatus::OnTrack
            } else {
                GoalStatus::Behind
            }
        }
    }
}

pub fn evaluate_goal(goal: &Goal, stats: &MonthStats) -> GoalProgress {
    let current = goal_current(goal, stats);
    let percentage = goal_percentage(current, goal.target_amount);
    let mut goal = goal.clone();
    goal.current_amount = current;

    GoalProgress {
        status: goal_status(goal.goal_type, percentage),
        goal,
        current,
        percentage,
    }
}

fn created_in_month(created_at: i64, today: Date) -> bool {
    OffsetDateTime::from_unix_timestamp(created_at)
        .map(|t| t.year() == today.year() && t.month() == today.month())
        .unwrap_or(false)
}

fn goal_label(goal: &Goal) -> &str {
    let description = goal.description.trim();
    if description.is_empty() {
        goal.goal_type.as_str()
    } else {
        description
    }
}

/// Advice for the month, most important first. Never more than six entries;
/// padded with a general reminder when fewer than three rules fired.
pub fn recommendations(progress: &[GoalProgress], stats: &MonthStats, today: Date) -> Vec<String> {
    let mut out = Vec::new();

    if stats.total_expense > 0.0 {
        // first entry wins ties, BTreeMap iterates by name
        let top = stats
            .expenses_by_category
            .iter()
            .fold(None::<(&String, f64)>, |best, (name, value)| match best {
                Some((_, best_value)) if best_value >= *value => best,
                _ => Some((name, *value)),
            });
        if let Some((name, value)) = top {
            let share = value / stats.total_expense * 100.0;
            if share >= 40.0 {
                out.push(format!(
                    "{} takes {:.0}% of your expenses this month. Look for ways to reduce it.",
                    name, share
                ));
            } else if share >= 25.0 {
                out.push(format!(
                    "{} is your largest expense category at {:.0}%. Keep an eye on it.",
                    name, share
                ));
            }
        }
    }

    if stats.total_profit < 0.0 {
        out.push(format!(
            "You are operating at a loss of {:.2} this month. Review your expenses.",
            -stats.total_profit
        ));
    } else if stats.total_income > 0.0 {
        if stats.total_profit < stats.total_income * 0.10 {
            out.push(
                "Your profit margin is below 10%. Consider raising prices or cutting costs."
                    .to_string(),
            );
        } else if stats.total_profit >= stats.total_income * 0.25 {
            out.push(format!(
                "Excellent margin: you keep {:.0}% of your income as profit.",
                stats.total_profit / stats.total_income * 100.0
            ));
        }
    }

    for entry in progress {
        let goal = &entry.goal;
        let label = goal_label(goal);
        let pct = entry.percentage;

        let message = match goal.goal_type {
            GoalType::Expense => {
                if pct >= 100.0 {
                    Some(format!("You have exceeded the budget for \"{}\".", label))
                } else if pct >= 85.0 {
                    Some(format!(
                        "You have used {:.0}% of the budget for \"{}\". Slow down spending.",
                        pct, label
                    ))
                } else if pct < 50.0 && entry.current > 0.0 {
                    Some(format!("Spending for \"{}\" is on a good pace.", label))
                } else if entry.current == 0.0 && created_in_month(goal.created_at, today) {
                    Some(format!(
                        "Start recording expenses to track \"{}\".",
                        label
                    ))
                } else {
                    None
                }
            }
            GoalType::Income => {
                if pct >= 100.0 {
                    Some(format!("Income goal \"{}\" reached. Well done!", label))
                } else if pct >= 75.0 {
                    Some(format!(
                        "Final stretch: \"{}\" is at {:.0}%.",
                        label, pct
                    ))
                } else if pct < 50.0 {
                    Some(format!(
                        "Income for \"{}\" is at {:.0}%. Time to accelerate sales.",
                        label, pct
                    ))
                } else {
                    None
                }
            }
            GoalType::Profit => {
                if pct >= 100.0 {
                    Some(format!("Profit goal \"{}\" exceeded.", label))
                } else if pct >= 80.0 {
                    Some(format!("Almost there: \"{}\" is at {:.0}%.", label, pct))
                } else if pct < 50.0 {
                    Some(format!(
                        "Profit for \"{}\" is at {:.0}%. Optimise costs and pricing.",
                        label, pct
                    ))
                } else {
                    None
                }
            }
        };

        if let Some(message) = message {
            out.push(message);
        }
    }

    if out.len() < MIN_SPECIFIC_RECOMMENDATIONS {
        out.push(
            "Record every transaction as it happens to keep these numbers accurate.".to_string(),
        );
    }

    out.truncate(MAX_RECOMMENDATIONS);
    out
}

pub async fn require_pro(app_state: &AppState, user: &User) -> Result<(), (StatusCode, String)> {
    if resolve_plan(app_state, user).await.is_pro() {
        Ok(())
    } else {
        Err((StatusCode::FORBIDDEN, ERR_PRO_REQUIRED.to_string()))
    }
}

pub fn extract_goal_from_row(row: libsql::Row) -> Result<Goal, (StatusCode, String)> {
    let invalid = |_| db_error_with_context("invalid goal data");

    let goal_type: String = row.get(1).map_err(invalid)?;
    let period: String = row.get(5).map_err(invalid)?;

    Ok(Goal {
        id: row.get(0).map_err(invalid)?,
        goal_type: goal_type
            .parse()
            .map_err(|_| db_error_with_context("invalid goal type"))?,
        category: row.get(2).map_err(invalid)?,
        target_amount: row.get(3).map_err(invalid)?,
        current_amount: row.get(4).map_err(invalid)?,
        period: period.parse().unwrap_or_default(),
        description: row.get(6).map_err(invalid)?,
        created_at: row.get(7).map_err(invalid)?,
    })
}

const GOAL_COLUMNS: &str =
    "id, type, category, target_amount, current_amount, period, description, created_at";

pub async fn load_goals(db: &Db, user_id: &str) -> Result<Vec<Goal>, (StatusCode, String)> {
    let conn = db.read().await;
    let mut rows = conn
        .query(
            &format!(
                "SELECT {} FROM goals WHERE user_id = ? ORDER BY created_at ASC, rowid ASC",
                GOAL_COLUMNS
            ),
            [user_id],
        )
        .await
        .map_err(|_| db_error_with_context("failed to query goals"))?;

    let mut goals = Vec::new();
    while let Some(row) = rows.next().await.map_err(|_| db_error())? {
        goals.push(extract_goal_from_row(row)?);
    }
    Ok(goals)
}

fn default_description(goal_type: GoalType) -> String {
    match goal_type {
        GoalType::Income => "Income goal".to_string(),
        GoalType::Expense => "Expense budget".to_string(),
        GoalType::Profit => "Profit goal".to_string(),
    }
}

pub async fn get_goals(
    State(app_state): State<AppState>,
    session: Session,
) -> Result<(StatusCode, Json<Vec<Goal>>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    require_pro(&app_state, &user).await?;

    let goals = load_goals(&app_state.db, &user.id).await?;
    Ok((StatusCode::OK, Json(goals)))
}

pub async fn create_goal(
    State(app_state): State<AppState>,
    session: Session,
    Json(payload): Json<CreateGoalPayload>,
) -> Result<(StatusCode, Json<Goal>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    require_pro(&app_state, &user).await?;

    validate_amount(payload.target_amount, "Target amount")?;
    // only expense goals narrow to a category
    let category = match payload.goal_type {
        GoalType::Expense => {
            normalize_optional(payload.category.as_deref(), "Category", MAX_CATEGORY_LENGTH)?
        }
        _ => None,
    };
    let description = normalize_optional(
        payload.description.as_deref(),
        "Description",
        MAX_DESCRIPTION_LENGTH,
    )?
    .unwrap_or_else(|| default_description(payload.goal_type));

    let goal = Goal {
        id: Uuid::new_v4().to_string(),
        goal_type: payload.goal_type,
        category,
        target_amount: payload.target_amount,
        current_amount: 0.0,
        period: payload.period.unwrap_or_default(),
        description,
        created_at: app_state.clock.unix_now(),
    };

    let conn = app_state.db.write().await;
    conn.execute(
        "INSERT INTO goals (id, user_id, type, category, target_amount, current_amount, period, description, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            goal.id.as_str(),
            user.id.as_str(),
            goal.goal_type.as_str(),
            goal.category.as_deref(),
            goal.target_amount,
            goal.current_amount,
            goal.period.as_str(),
            goal.description.as_str(),
            goal.created_at,
        ),
    )
    .await
    .map_err(|_| db_error_with_context("goal creation failed"))?;

    Ok((StatusCode::CREATED, Json(goal)))
}

pub async fn update_goal(
    State(app_state): State<AppState>,
    session: Session,
    Path(goal_id): Path<String>,
    Json(payload): Json<UpdateGoalPayload>,
) -> Result<(StatusCode, Json<Goal>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    require_pro(&app_state, &user).await?;

    if payload.category.is_none()
        && payload.target_amount.is_none()
        && payload.period.is_none()
        && payload.description.is_none()
    {
        return Err((
            StatusCode::BAD_REQUEST,
            "At least one field must be provided for update".to_string(),
        ));
    }
    if let Some(target) = payload.target_amount {
        validate_amount(target, "Target amount")?;
    }

    let conn = app_state.db.write().await;

    let mut rows = conn
        .query(
            &format!(
                "SELECT {} FROM goals WHERE id = ? AND user_id = ?",
                GOAL_COLUMNS
            ),
            (goal_id.as_str(), user.id.as_str()),
        )
        .await
        .map_err(|_| db_error_with_context("failed to query existing goal"))?;

    let existing = match rows.next().await.map_err(|_| db_error())? {
        Some(row) => extract_goal_from_row(row)?,
        None => return Err((StatusCode::NOT_FOUND, "Goal not found".to_string())),
    };

    let category = match (existing.goal_type, payload.category.as_deref()) {
        (GoalType::Expense, Some(category)) => {
            normalize_optional(Some(category), "Category", MAX_CATEGORY_LENGTH)?
        }
        (_, _) => existing.category.clone(),
    };
    let description = match payload.description.as_deref() {
        Some(description) => normalize_optional(
            Some(description),
            "Description",
            MAX_DESCRIPTION_LENGTH,
        )?
        .unwrap_or_else(|| default_description(existing.goal_type)),
        None => existing.description.clone(),
    };

    let updated = Goal {
        category,
        target_amount: payload.target_amount.unwrap_or(existing.target_amount),
        period: payload.period.unwrap_or(existing.period),
        description,
        ..existing
    };

    conn.execute(
        "UPDATE goals SET category = ?, target_amount = ?, period = ?, description = ? WHERE id = ? AND user_id = ?",
        (
            updated.category.as_deref(),
            updated.target_amount,
            updated.period.as_str(),
            updated.description.as_str(),
            updated.id.as_str(),
            user.id.as_str(),
        ),
    )
    .await
    .map_err(|_| db_error_with_context("failed to update goal"))?;

    Ok((StatusCode::OK, Json(updated)))
}

pub async fn delete_goal(
    State(app_state): State<AppState>,
    session: Session,
    Path(goal_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    require_pro(&app_state, &user).await?;

    let conn = app_state.db.write().await;
    let affected_rows = conn
        .execute(
            "DELETE FROM goals WHERE id = ? AND user_id = ?",
            (goal_id.as_str(), user.id.as_str()),
        )
        .await
        .map_err(|_| db_error_with_context("failed to delete goal"))?;

    if affected_rows == 0 {
        return Err((StatusCode::NOT_FOUND, "Goal not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn goals_progress(
    State(app_state): State<AppState>,
    session: Session,
) -> Result<(StatusCode, Json<GoalsProgressResponse>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    require_pro(&app_state, &user).await?;

    let today = app_state.clock.now().date();
    let transactions = load_user_transactions(&app_state.db, &user.id).await?;
    let stats = month_stats(&transactions, today);
    let goals = load_goals(&app_state.db, &user.id).await?;

    let progress: Vec<GoalProgress> = goals.iter().map(|g| evaluate_goal(g, &stats)).collect();
    let recommendations = recommendations(&progress, &stats, today);

    Ok((
        StatusCode::OK,
        Json(GoalsProgressResponse {
            goals: progress,
            recommendations,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GoalPeriod;
    use std::collections::BTreeMap;
    use time::macros::{date, datetime};

    fn goal(goal_type: GoalType, target: f64, category: Option<&str>) -> Goal {
        Goal {
            id: "g1".to_string(),
            goal_type,
            category: category.map(str::to_string),
            target_amount: target,
            current_amount: 0.0,
            period: GoalPeriod::Monthly,
            description: "Test goal".to_string(),
            created_at: datetime!(2023-06-01 00:00 UTC).unix_timestamp(),
        }
    }

    fn stats(income: f64, expenses: &[(&str, f64)]) -> MonthStats {
        let expenses_by_category: BTreeMap<String, f64> = expenses
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect();
        let total_expense: f64 = expenses_by_category.values().sum();
        MonthStats {
            total_income: income,
            total_expense,
            total_profit: income - total_expense,
            expenses_by_category,
        }
    }

    #[test]
    fn half_way_profit_goal_is_on_track() {
        let progress = evaluate_goal(
            &goal(GoalType::Profit, 1000.0, None),
            &stats(700.0, &[("Rent", 200.0)]),
        );
        assert_eq!(progress.current, 500.0);
        assert_eq!(progress.percentage, 50.0);
        assert_eq!(progress.status, GoalStatus::OnTrack);
    }

    #[test]
    fn zero_target_is_zero_percent() {
        assert_eq!(goal_percentage(500.0, 0.0), 0.0);
        assert_eq!(goal_percentage(500.0, -10.0), 0.0);
        assert_eq!(goal_percentage(2000.0, 1000.0), 100.0);
    }

    #[test]
    fn expense_bands() {
        assert_eq!(goal_status(GoalType::Expense, 50.0), GoalStatus::Comfortable);
        assert_eq!(goal_status(GoalType::Expense, 85.0), GoalStatus::WithinBudget);
        assert_eq!(goal_status(GoalType::Expense, 99.9), GoalStatus::NearLimit);
        assert_eq!(goal_status(GoalType::Expense, 100.0), GoalStatus::OverBudget);
    }

    #[test]
    fn income_bands() {
        assert_eq!(goal_status(GoalType::Income, 100.0), GoalStatus::Met);
        assert_eq!(goal_status(GoalType::Income, 75.0), GoalStatus::OnTrack);
        assert_eq!(goal_status(GoalType::Income, 49.9), GoalStatus::Behind);
    }

    #[test]
    fn category_goal_uses_category_expense() {
        let s = stats(0.0, &[("Rent", 300.0), ("Food", 100.0)]);
        assert_eq!(goal_current(&goal(GoalType::Expense, 400.0, Some("Food")), &s), 100.0);
        assert_eq!(goal_current(&goal(GoalType::Expense, 400.0, Some("Travel")), &s), 0.0);
        assert_eq!(goal_current(&goal(GoalType::Expense, 400.0, None), &s), 400.0);
    }

    #[test]
    fn dominant_category_and_loss_are_flagged_first() {
        let s = stats(100.0, &[("Rent", 300.0), ("Food", 50.0)]);
        let recs = recommendations(&[], &s, date!(2024 - 01 - 15));
        assert!(recs[0].starts_with("Rent takes 86%"));
        assert!(recs[1].contains("loss of 250.00"));
        // filler appended because only two rules fired
        assert_eq!(recs.len(), 3);
    }

    #[test]
    fn filler_only_when_few_recommendations() {
        let s = stats(
            1000.0,
            &[("Rent", 100.0), ("Food", 100.0), ("Fuel", 100.0), ("Misc", 100.0)],
        );
        let progress: Vec<GoalProgress> = vec![
            evaluate_goal(&goal(GoalType::Income, 500.0, None), &s),
            evaluate_goal(&goal(GoalType::Expense, 100.0, Some("Rent")), &s),
        ];
        let recs = recommendations(&progress, &s, date!(2024 - 01 - 15));

        // 25% share tip, strong margin, income met, budget exceeded
        assert_eq!(recs.len(), 4);
        assert!(recs.iter().all(|r| !r.starts_with("Record every transaction")));
    }

    #[test]
    fn list_is_capped() {
        let s = stats(1000.0, &[("Rent", 900.0)]);
        let progress: Vec<GoalProgress> = (0..10)
            .map(|_| evaluate_goal(&goal(GoalType::Expense, 100.0, None), &s))
            .collect();
        assert_eq!(
            recommendations(&progress, &s, date!(2024 - 01 - 15)).len(),
            MAX_RECOMMENDATIONS
        );
    }

    #[test]
    fn new_goal_without_spending_prompts_recording() {
        let mut g = goal(GoalType::Expense, 100.0, Some("Travel"));
        g.created_at = datetime!(2024-01-03 10:00 UTC).unix_timestamp();
        let s = stats(0.0, &[]);
        let progress = vec![evaluate_goal(&g, &s)];
        let recs = recommendations(&progress, &s, date!(2024 - 01 - 15));
        assert!(recs.iter().any(|r| r.starts_with("Start recording expenses")));
    }
}
