use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use tower_sessions::Session;
use uuid::Uuid;

use crate::auth::{current_account, resolve_plan};
use crate::constants::*;
use crate::models::{
    CreateTransactionPayload, GetTransactionsQuery, GetTransactionsResponse, ResourceType,
    Transaction, UpdateTransactionPayload, WeeklyLimit,
};
use crate::usage::{check_weekly_limit, ensure_can_create};
use crate::utils::{
    client_name_for, db_error, db_error_with_context, normalize_optional, validate_amount,
    validate_date, validate_offset, validate_transactions_limit,
};
use crate::{AppState, Db};

const TRANSACTION_SELECT: &str = "SELECT t.id, t.client_id, c.name, t.amount, t.type, t.category, t.description, t.date, t.created_at FROM transactions t LEFT JOIN clients c ON c.id = t.client_id AND c.user_id = t.user_id";

pub fn extract_transaction_from_row(row: libsql::Row) -> Result<Transaction, (StatusCode, String)> {
    let invalid = |_| db_error_with_context("invalid transaction data");

    let transaction_type: String = row.get(4).map_err(invalid)?;
    let transaction_type = transaction_type
        .parse()
        .map_err(|_| db_error_with_context("invalid transaction type"))?;

    Ok(Transaction {
        id: row.get(0).map_err(invalid)?,
        client_id: row.get(1).map_err(invalid)?,
        client_name: row.get(2).map_err(invalid)?,
        amount: row.get(3).map_err(invalid)?,
        transaction_type,
        category: row.get(5).map_err(invalid)?,
        description: row.get(6).map_err(invalid)?,
        date: row.get(7).map_err(invalid)?,
        created_at: row.get(8).map_err(invalid)?,
    })
}

/// Every transaction of the user, in insertion order. Input to aggregation.
pub async fn load_user_transactions(
    db: &Db,
    user_id: &str,
) -> Result<Vec<Transaction>, (StatusCode, String)> {
    let conn = db.read().await;
    let mut rows = conn
        .query(
            &format!(
                "{} WHERE t.user_id = ? ORDER BY t.created_at ASC, t.rowid ASC",
                TRANSACTION_SELECT
            ),
            [user_id],
        )
        .await
        .map_err(|_| db_error_with_context("failed to load transactions"))?;

    let mut transactions = Vec::new();
    while let Some(row) = rows.next().await.map_err(|_| db_error())? {
        transactions.push(extract_transaction_from_row(row)?);
    }
    Ok(transactions)
}

pub async fn recent_transactions(
    db: &Db,
    user_id: &str,
    limit: u32,
) -> Result<Vec<Transaction>, (StatusCode, String)> {
    let conn = db.read().await;
    let mut rows = conn
        .query(
            &format!(
                "{} WHERE t.user_id = ? ORDER BY t.date DESC, t.created_at DESC LIMIT ?",
                TRANSACTION_SELECT
            ),
            (user_id, limit),
        )
        .await
        .map_err(|_| db_error_with_context("failed to load recent transactions"))?;

    let mut transactions = Vec::new();
    while let Some(row) = rows.next().await.map_err(|_| db_error())? {
        transactions.push(extract_transaction_from_row(row)?);
    }
    Ok(transactions)
}

async fn find_transaction(
    db: &Db,
    user_id: &str,
    transaction_id: &str,
) -> Result<Transaction, (StatusCode, String)> {
    let conn = db.read().await;
    let mut rows = conn
        .query(
            &format!("{} WHERE t.id = ? AND t.user_id = ?", TRANSACTION_SELECT),
            (transaction_id, user_id),
        )
        .await
        .map_err(|_| db_error_with_context("failed to query transaction"))?;

    match rows.next().await.map_err(|_| db_error())? {
        Some(row) => extract_transaction_from_row(row),
        None => Err((StatusCode::NOT_FOUND, "Transaction not found".to_string())),
    }
}

/// Resolves an optional client reference. Blank detaches.
async fn resolve_client(
    db: &Db,
    user_id: &str,
    client_id: Option<&str>,
) -> Result<(Option<String>, Option<String>), (StatusCode, String)> {
    match client_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => {
            let name = client_name_for(db, user_id, id).await?;
            Ok((Some(id.to_string()), Some(name)))
        }
        None => Ok((None, None)),
    }
}

pub async fn create_transaction(
    State(app_state): State<AppState>,
    session: Session,
    Json(payload): Json<CreateTransactionPayload>,
) -> Result<(StatusCode, Json<Transaction>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;

    validate_amount(payload.amount, "Amount")?;
    validate_date(&payload.date)?;
    let category = normalize_optional(payload.category.as_deref(), "Category", MAX_CATEGORY_LENGTH)?
        .unwrap_or_default();
    let description = normalize_optional(
        payload.description.as_deref(),
        "Description",
        MAX_DESCRIPTION_LENGTH,
    )?;
    let (client_id, client_name) =
        resolve_client(&app_state.db, &user.id, payload.client_id.as_deref()).await?;

    let now = app_state.clock.unix_now();
    let plan = resolve_plan(&app_state, &user).await;
    ensure_can_create(&app_state.db, &user.id, ResourceType::Transactions, plan, now).await?;

    let transaction = Transaction {
        id: Uuid::new_v4().to_string(),
        client_id,
        client_name,
        amount: payload.amount,
        transaction_type: payload.transaction_type,
        category,
        description,
        date: payload.date.trim().to_string(),
        created_at: now,
    };

    let conn = app_state.db.write().await;
    conn.execute(
        "INSERT INTO transactions (id, user_id, client_id, amount, type, category, description, date, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            transaction.id.as_str(),
            user.id.as_str(),
            transaction.client_id.as_deref(),
            transaction.amount,
            transaction.transaction_type.as_str(),
            transaction.category.as_str(),
            transaction.description.as_deref(),
            transaction.date.as_str(),
            transaction.created_at,
        ),
    )
    .await
    .map_err(|_| db_error_with_context("transaction creation failed"))?;

    Ok((StatusCode::CREATED, Json(transaction)))
}

pub async fn get_transactions(
    State(app_state): State<AppState>,
    session: Session,
    Query(query): Query<GetTransactionsQuery>,
) -> Result<(StatusCode, Json<GetTransactionsResponse>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;

    let limit = validate_transactions_limit(query.limit)?;
    let offset = validate_offset(query.offset)?;

    if let Some(ref start_date) = query.start_date {
        validate_date(start_date)?;
    }
    if let Some(ref end_date) = query.end_date {
        validate_date(end_date)?;
    }

    let start_date = query
        .start_date
        .map(|d| d.trim().to_string())
        .unwrap_or_else(|| "0000-01-01".to_string());
    let end_date = query
        .end_date
        .map(|d| d.trim().to_string())
        .unwrap_or_else(|| "9999-12-31".to_string());
    let transaction_type = query.transaction_type.map(|t| t.as_str());
    let client_id = query
        .client_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let conn = app_state.db.read().await;

    let filter = "t.user_id = ? AND t.date BETWEEN ? AND ? AND (? IS NULL OR t.type = ?) AND (? IS NULL OR t.client_id = ?)";

    let mut count_rows = conn
        .query(
            &format!("SELECT COUNT(*) FROM transactions t WHERE {}", filter),
            (
                user.id.as_str(),
                start_date.as_str(),
                end_date.as_str(),
                transaction_type,
                transaction_type,
                client_id,
                client_id,
            ),
        )
        .await
        .map_err(|_| db_error_with_context("failed to count transactions"))?;

    let total_count: u32 = if let Some(row) = count_rows.next().await.map_err(|_| db_error())? {
        row.get(0).map_err(|_| db_error())?
    } else {
        0
    };

    let mut rows = conn
        .query(
            &format!(
                "{} WHERE {} ORDER BY t.date DESC, t.created_at DESC LIMIT ? OFFSET ?",
                TRANSACTION_SELECT, filter
            ),
            (
                user.id.as_str(),
                start_date.as_str(),
                end_date.as_str(),
                transaction_type,
                transaction_type,
                client_id,
                client_id,
                limit,
                offset,
            ),
        )
        .await
        .map_err(|_| db_error_with_context("failed to query transactions"))?;

    let mut transactions = Vec::new();
    while let Some(row) = rows.next().await.map_err(|_| db_error())? {
        transactions.push(extract_transaction_from_row(row)?);
    }

    Ok((
        StatusCode::OK,
        Json(GetTransactionsResponse {
            transactions,
            total_count,
        }),
    ))
}

pub async fn update_transaction(
    State(app_state): State<AppState>,
    session: Session,
    Path(transaction_id): Path<String>,
    Json(payload): Json<UpdateTransactionPayload>,
) -> Result<(StatusCode, Json<Transaction>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;

    if payload.client_id.is_none()
        && payload.amount.is_none()
        && payload.transaction_type.is_none()
        && payload.category.is_none()
        && payload.description.is_none()
        && payload.date.is_none()
    {
        return Err((
            StatusCode::BAD_REQUEST,
            "At least one field must be provided for update".to_string(),
        ));
    }

    if let Some(amount) = payload.amount {
        validate_amount(amount, "Amount")?;
    }
    if let Some(ref date) = payload.date {
        validate_date(date)?;
    }

    let existing = find_transaction(&app_state.db, &user.id, &transaction_id).await?;

    let (client_id, client_name) = match payload.client_id.as_deref() {
        Some(id) => resolve_client(&app_state.db, &user.id, Some(id)).await?,
        None => (existing.client_id, existing.client_name),
    };
    let category = match payload.category.as_deref() {
        Some(category) => normalize_optional(Some(category), "Category", MAX_CATEGORY_LENGTH)?
            .unwrap_or_default(),
        None => existing.category,
    };
    let description = match payload.description.as_deref() {
        Some(description) => {
            normalize_optional(Some(description), "Description", MAX_DESCRIPTION_LENGTH)?
        }
        None => existing.description,
    };

    let updated = Transaction {
        id: existing.id,
        client_id,
        client_name,
        amount: payload.amount.unwrap_or(existing.amount),
        transaction_type: payload
            .transaction_type
            .unwrap_or(existing.transaction_type),
        category,
        description,
        date: payload
            .date
            .map(|d| d.trim().to_string())
            .unwrap_or(existing.date),
        created_at: existing.created_at,
    };

    let conn = app_state.db.write().await;
    let affected_rows = conn
        .execute(
            "UPDATE transactions SET client_id = ?, amount = ?, type = ?, category = ?, description = ?, date = ? WHERE id = ? AND user_id = ?",
            (
                updated.client_id.as_deref(),
                updated.amount,
                updated.transaction_type.as_str(),
                updated.category.as_str(),
                updated.description.as_deref(),
                updated.date.as_str(),
                updated.id.as_str(),
                user.id.as_str(),
            ),
        )
        .await
        .map_err(|_| db_error_with_context("failed to update transaction"))?;

    if affected_rows == 0 {
        return Err((StatusCode::NOT_FOUND, "Transaction not found".to_string()));
    }

    Ok((StatusCode::OK, Json(updated)))
}

pub async fn delete_transaction(
    State(app_state): State<AppState>,
    session: Session,
    Path(transaction_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;

    let conn = app_state.db.write().await;
    let affected_rows = conn
        .execute(
            "DELETE FROM transactions WHERE id = ? AND user_id = ?",
            (transaction_id.as_str(), user.id.as_str()),
        )
        .await
        .map_err(|_| db_error_with_context("failed to delete transaction"))?;

    if affected_rows == 0 {
        return Err((StatusCode::NOT_FOUND, "Transaction not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn transaction_limit(
    State(app_state): State<AppState>,
    session: Session,
) -> Result<(StatusCode, Json<WeeklyLimit>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    let plan = resolve_plan(&app_state, &user).await;
    let limit = check_weekly_limit(
        &app_state.db,
        &user.id,
        ResourceType::Transactions,
        plan,
        app_state.clock.unix_now(),
    )
    .await?;
    Ok((StatusCode::OK, Json(limit)))
}
