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
    Client, CreateClientPayload, GetClientsQuery, GetClientsResponse, ResourceType,
    UpdateClientPayload, WeeklyLimit,
};
use crate::usage::{check_weekly_limit, ensure_can_create};
use crate::utils::{
    db_error, db_error_with_context, normalize_email, normalize_optional, validate_clients_limit,
    validate_offset, validate_string_length,
};
use crate::{AppState, TransactionError, with_transaction};

enum DeleteClientError {
    Transaction(TransactionError),
    Db(&'static str),
    NotFound,
}

impl From<TransactionError> for DeleteClientError {
    fn from(value: TransactionError) -> Self {
        Self::Transaction(value)
    }
}

impl From<DeleteClientError> for (StatusCode, String) {
    fn from(value: DeleteClientError) -> Self {
        match value {
            DeleteClientError::Transaction(TransactionError::Begin) => {
                db_error_with_context("failed to begin transaction")
            }
            DeleteClientError::Transaction(TransactionError::Commit) => {
                db_error_with_context("failed to commit transaction")
            }
            DeleteClientError::Db(ctx) => db_error_with_context(ctx),
            DeleteClientError::NotFound => (StatusCode::NOT_FOUND, "Client not found".to_string()),
        }
    }
}

pub fn validate_client_name(name: &str) -> Result<(), (StatusCode, String)> {
    validate_string_length(name, "Client name", MAX_CLIENT_NAME_LENGTH)
}

fn normalize_client_email(email: Option<&str>) -> Result<Option<String>, (StatusCode, String)> {
    match email.map(str::trim).filter(|e| !e.is_empty()) {
        Some(email) => normalize_email(email).map(Some),
        None => Ok(None),
    }
}

pub fn extract_client_from_row(row: libsql::Row) -> Result<Client, (StatusCode, String)> {
    let invalid = |_| db_error_with_context("invalid client data");

    Ok(Client {
        id: row.get(0).map_err(invalid)?,
        name: row.get(1).map_err(invalid)?,
        email: row.get(2).map_err(invalid)?,
        phone: row.get(3).map_err(invalid)?,
        created_at: row.get(4).map_err(invalid)?,
    })
}

pub async fn create_client(
    State(app_state): State<AppState>,
    session: Session,
    Json(payload): Json<CreateClientPayload>,
) -> Result<(StatusCode, Json<Client>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;

    validate_client_name(&payload.name)?;
    let email = normalize_client_email(payload.email.as_deref())?;
    let phone = normalize_optional(payload.phone.as_deref(), "Phone", MAX_PHONE_LENGTH)?;

    let now = app_state.clock.unix_now();
    let plan = resolve_plan(&app_state, &user).await;
    ensure_can_create(&app_state.db, &user.id, ResourceType::Clients, plan, now).await?;

    let client = Client {
        id: Uuid::new_v4().to_string(),
        name: payload.name.trim().to_string(),
        email,
        phone,
        created_at: now,
    };

    let conn = app_state.db.write().await;
    conn.execute(
        "INSERT INTO clients (id, user_id, name, email, phone, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        (
            client.id.as_str(),
            user.id.as_str(),
            client.name.as_str(),
            client.email.as_deref(),
            client.phone.as_deref(),
            client.created_at,
        ),
    )
    .await
    .map_err(|_| db_error_with_context("client creation failed"))?;

    Ok((StatusCode::CREATED, Json(client)))
}

pub async fn get_clients(
    State(app_state): State<AppState>,
    session: Session,
    Query(query): Query<GetClientsQuery>,
) -> Result<(StatusCode, Json<GetClientsResponse>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;

    let limit = validate_clients_limit(query.limit)?;
    let offset = validate_offset(query.offset)?;

    let search = normalize_optional(query.search.as_deref(), "Search term", MAX_SEARCH_TERM_LENGTH)?
        .map(|term| format!("%{}%", term.to_lowercase()));

    let conn = app_state.db.read().await;

    let filter = "user_id = ? AND (? IS NULL OR LOWER(name) LIKE ? OR LOWER(COALESCE(email, '')) LIKE ?)";

    let mut count_rows = conn
        .query(
            &format!("SELECT COUNT(*) FROM clients WHERE {}", filter),
            (
                user.id.as_str(),
                search.as_deref(),
                search.as_deref(),
                search.as_deref(),
            ),
        )
        .await
        .map_err(|_| db_error_with_context("failed to count clients"))?;

    let total_count: u32 = if let Some(row) = count_rows.next().await.map_err(|_| db_error())? {
        row.get(0).map_err(|_| db_error())?
    } else {
        0
    };

    let mut rows = conn
        .query(
            &format!(
                "SELECT id, name, email, phone, created_at FROM clients WHERE {} ORDER BY name COLLATE NOCASE ASC LIMIT ? OFFSET ?",
                filter
            ),
            (
                user.id.as_str(),
                search.as_deref(),
                search.as_deref(),
                search.as_deref(),
                limit,
                offset,
            ),
        )
        .await
        .map_err(|_| db_error_with_context("failed to query clients"))?;

    let mut clients = Vec::new();
    while let Some(row) = rows.next().await.map_err(|_| db_error())? {
        clients.push(extract_client_from_row(row)?);
    }

    Ok((
        StatusCode::OK,
        Json(GetClientsResponse {
            clients,
            total_count,
            limit,
            offset,
        }),
    ))
}

pub async fn update_client(
    State(app_state): State<AppState>,
    session: Session,
    Path(client_id): Path<String>,
    Json(payload): Json<UpdateClientPayload>,
) -> Result<(StatusCode, Json<Client>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;

    if payload.name.is_none() && payload.email.is_none() && payload.phone.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            "At least one field must be provided for update".to_string(),
        ));
    }

    if let Some(ref name) = payload.name {
        validate_client_name(name)?;
    }

    let conn = app_state.db.write().await;

    let mut existing_rows = conn
        .query(
            "SELECT id, name, email, phone, created_at FROM clients WHERE id = ? AND user_id = ?",
            (client_id.as_str(), user.id.as_str()),
        )
        .await
        .map_err(|_| db_error_with_context("failed to query existing client"))?;

    let existing = match existing_rows.next().await.map_err(|_| db_error())? {
        Some(row) => extract_client_from_row(row)?,
        None => return Err((StatusCode::NOT_FOUND, "Client not found".to_string())),
    };

    let updated = Client {
        id: existing.id,
        name: payload
            .name
            .map(|n| n.trim().to_string())
            .unwrap_or(existing.name),
        email: match payload.email.as_deref() {
            Some(email) => normalize_client_email(Some(email))?,
            None => existing.email,
        },
        phone: match payload.phone.as_deref() {
            Some(phone) => normalize_optional(Some(phone), "Phone", MAX_PHONE_LENGTH)?,
            None => existing.phone,
        },
        created_at: existing.created_at,
    };

    conn.execute(
        "UPDATE clients SET name = ?, email = ?, phone = ? WHERE id = ? AND user_id = ?",
        (
            updated.name.as_str(),
            updated.email.as_deref(),
            updated.phone.as_deref(),
            updated.id.as_str(),
            user.id.as_str(),
        ),
    )
    .await
    .map_err(|_| db_error_with_context("failed to update client"))?;

    Ok((StatusCode::OK, Json(updated)))
}

/// Deletes the client and detaches its transactions in one database transaction.
/// The transactions themselves are kept.
pub async fn delete_client(
    State(app_state): State<AppState>,
    session: Session,
    Path(client_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    let user_id = user.id.clone();

    with_transaction(&app_state.db, |conn| {
        Box::pin(async move {
            conn.execute(
                "UPDATE transactions SET client_id = NULL WHERE client_id = ? AND user_id = ?",
                (client_id.as_str(), user_id.as_str()),
            )
            .await
            .map_err(|_| DeleteClientError::Db("failed to detach client transactions"))?;

            let affected_rows = conn
                .execute(
                    "DELETE FROM clients WHERE id = ? AND user_id = ?",
                    (client_id.as_str(), user_id.as_str()),
                )
                .await
                .map_err(|_| DeleteClientError::Db("failed to delete client"))?;

            if affected_rows == 0 {
                return Err(DeleteClientError::NotFound);
            }
            Ok::<(), DeleteClientError>(())
        })
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn client_limit(
    State(app_state): State<AppState>,
    session: Session,
) -> Result<(StatusCode, Json<WeeklyLimit>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    let plan = resolve_plan(&app_state, &user).await;
    let limit = check_weekly_limit(
        &app_state.db,
        &user.id,
        ResourceType::Clients,
        plan,
        app_state.clock.unix_now(),
    )
    .await?;
    Ok((StatusCode::OK, Json(limit)))
}
