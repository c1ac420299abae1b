use axum::http::StatusCode;
use time::{Date, macros::format_description};

use crate::Db;
use crate::constants::*;

pub fn db_error() -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        ERR_DATABASE_OPERATION.to_string(),
    )
}

pub fn db_error_with_context(context: &str) -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Database error: {}", context),
    )
}

pub fn validate_string_length(
    value: &str,
    field_name: &str,
    max_length: usize,
) -> Result<(), (StatusCode, String)> {
    if value.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("{} cannot be empty", field_name),
        ));
    }
    if value.len() > max_length {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("{} must be less than {} characters", field_name, max_length),
        ));
    }
    Ok(())
}

/// Trims an optional text field; blank values collapse to `None`.
pub fn normalize_optional(
    value: Option<&str>,
    field_name: &str,
    max_length: usize,
) -> Result<Option<String>, (StatusCode, String)> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) if v.len() > max_length => Err((
            StatusCode::BAD_REQUEST,
            format!("{} must be less than {} characters", field_name, max_length),
        )),
        Some(v) => Ok(Some(v.to_string())),
        None => Ok(None),
    }
}

pub fn parse_date(value: &str) -> Result<Date, (StatusCode, String)> {
    if value.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Date cannot be empty".to_string()));
    }

    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid date format".to_string()))
}

pub fn validate_date(value: &str) -> Result<(), (StatusCode, String)> {
    parse_date(value).map(|_| ())
}

pub fn validate_amount(amount: f64, field_name: &str) -> Result<(), (StatusCode, String)> {
    if !amount.is_finite() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("{} must be a valid finite number", field_name),
        ));
    }
    if amount <= 0.0 {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("{} must be greater than zero", field_name),
        ));
    }
    Ok(())
}

pub fn normalize_email(email: &str) -> Result<String, (StatusCode, String)> {
    let email = email.trim().to_lowercase();
    validate_string_length(&email, "Email", MAX_EMAIL_LENGTH)?;

    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        }
        None => false,
    };
    if !valid {
        return Err((StatusCode::BAD_REQUEST, "Invalid email address".to_string()));
    }
    Ok(email)
}

pub fn validate_password(password: &str) -> Result<(), (StatusCode, String)> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            ),
        ));
    }
    Ok(())
}

/// Name of the user's client, or 400 when it does not exist for this user.
pub async fn client_name_for(
    db: &Db,
    user_id: &str,
    client_id: &str,
) -> Result<String, (StatusCode, String)> {
    let conn = db.read().await;
    let mut rows = conn
        .query(
            "SELECT name FROM clients WHERE id = ? AND user_id = ?",
            (client_id, user_id),
        )
        .await
        .map_err(|_| db_error_with_context("failed to check client existence"))?;

    match rows.next().await.map_err(|_| db_error())? {
        Some(row) => row.get(0).map_err(|_| db_error()),
        None => Err((StatusCode::BAD_REQUEST, "Client does not exist".to_string())),
    }
}

pub fn validate_limit(limit: Option<u32>, default: u32) -> Result<u32, (StatusCode, String)> {
    match limit {
        Some(l) => {
            if l == 0 {
                Err((
                    StatusCode::BAD_REQUEST,
                    "Limit must be greater than 0".to_string(),
                ))
            } else if l > MAX_LIMIT {
                Err((
                    StatusCode::BAD_REQUEST,
                    format!("Limit cannot exceed {}", MAX_LIMIT),
                ))
            } else {
                Ok(l)
            }
        }
        None => Ok(default),
    }
}

pub fn validate_clients_limit(limit: Option<u32>) -> Result<u32, (StatusCode, String)> {
    validate_limit(limit, DEFAULT_CLIENTS_LIMIT)
}

pub fn validate_transactions_limit(limit: Option<u32>) -> Result<u32, (StatusCode, String)> {
    validate_limit(limit, DEFAULT_TRANSACTIONS_LIMIT)
}

pub fn validate_offset(offset: Option<u32>) -> Result<u32, (StatusCode, String)> {
    match offset {
        Some(o) => {
            if o > MAX_OFFSET {
                Err((
                    StatusCode::BAD_REQUEST,
                    format!("Offset cannot exceed {}", MAX_OFFSET),
                ))
            } else {
                Ok(o)
            }
        }
        None => Ok(0),
    }
}
