use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use axum::{Json, extract::State, http::StatusCode};
use password_hash::rand_core::OsRng;
use tower_sessions::Session;
use uuid::Uuid;

use crate::billing::BillingIdentity;
use crate::constants::*;
use crate::models::{LoginPayload, PlanType, PublicUser, RegisterPayload, SessionUser, User};
use crate::utils::{
    db_error, db_error_with_context, normalize_email, normalize_optional, validate_password,
};
use crate::{AppState, Db};

const USER_COLUMNS: &str =
    "id, email, full_name, password_hash, plan_type, plan_expiry_date, stripe_customer_id";

pub fn hash_password(password: &str) -> Result<String, (StatusCode, String)> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to hash password".to_string(),
            )
        })
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

pub fn extract_user_from_row(row: libsql::Row) -> Result<User, (StatusCode, String)> {
    let invalid = |_| db_error_with_context("invalid user data");

    let plan_type: String = row.get(4).map_err(invalid)?;

    Ok(User {
        id: row.get(0).map_err(invalid)?,
        email: row.get(1).map_err(invalid)?,
        full_name: row.get(2).map_err(invalid)?,
        password_hash: row.get(3).map_err(invalid)?,
        plan_type: plan_type.parse().unwrap_or_default(),
        plan_expiry_date: row.get(5).map_err(invalid)?,
        stripe_customer_id: row.get(6).map_err(invalid)?,
    })
}

pub async fn find_user_by_email(
    db: &Db,
    email: &str,
) -> Result<Option<User>, (StatusCode, String)> {
    let conn = db.read().await;
    let mut rows = conn
        .query(
            &format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS),
            [email],
        )
        .await
        .map_err(|_| db_error_with_context("failed to look up user"))?;

    match rows.next().await.map_err(|_| db_error())? {
        Some(row) => Ok(Some(extract_user_from_row(row)?)),
        None => Ok(None),
    }
}

pub async fn load_user(db: &Db, user_id: &str) -> Result<User, (StatusCode, String)> {
    let conn = db.read().await;
    let mut rows = conn
        .query(
            &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
            [user_id],
        )
        .await
        .map_err(|_| db_error_with_context("failed to load user"))?;

    match rows.next().await.map_err(|_| db_error())? {
        Some(row) => extract_user_from_row(row),
        None => Err((StatusCode::UNAUTHORIZED, ERR_INVALID_SESSION.to_string())),
    }
}

pub async fn get_current_user(session: &Session) -> Result<SessionUser, (StatusCode, String)> {
    session
        .get::<SessionUser>(SESSION_USER_KEY)
        .await
        .map_err(|_| (StatusCode::UNAUTHORIZED, ERR_INVALID_SESSION.to_string()))?
        .ok_or((StatusCode::UNAUTHORIZED, ERR_UNAUTHORIZED.to_string()))
}

/// Session user reloaded from the store, so plan and profile fields are current.
pub async fn current_account(
    app_state: &AppState,
    session: &Session,
) -> Result<User, (StatusCode, String)> {
    let session_user = get_current_user(session).await?;
    load_user(&app_state.db, &session_user.id).await
}

/// Plan used for gating, resolved through the subscription cache.
pub async fn resolve_plan(app_state: &AppState, user: &User) -> PlanType {
    app_state
        .subscriptions
        .plan_for(&BillingIdentity::from(user))
        .await
}

async fn start_session(session: &Session, user: &User) -> Result<(), (StatusCode, String)> {
    session.cycle_id().await.map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create session".to_string(),
        )
    })?;
    session
        .insert(
            SESSION_USER_KEY,
            SessionUser {
                id: user.id.clone(),
                email: user.email.clone(),
            },
        )
        .await
        .map_err(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to create session".to_string(),
            )
        })
}

pub async fn register(
    State(app_state): State<AppState>,
    session: Session,
    Json(payload): Json<RegisterPayload>,
) -> Result<(StatusCode, Json<PublicUser>), (StatusCode, String)> {
    let email = normalize_email(&payload.email)?;
    validate_password(&payload.password)?;
    let full_name = normalize_optional(
        payload.full_name.as_deref(),
        "Full name",
        MAX_FULL_NAME_LENGTH,
    )?;

    if find_user_by_email(&app_state.db, &email).await?.is_some() {
        return Err((
            StatusCode::CONFLICT,
            "An account with this email already exists".to_string(),
        ));
    }

    let password_hash = hash_password(&payload.password)?;
    let user = User {
        id: Uuid::new_v4().to_string(),
        email,
        full_name,
        password_hash,
        plan_type: PlanType::Free,
        plan_expiry_date: None,
        stripe_customer_id: None,
    };

    {
        let conn = app_state.db.write().await;
        conn.execute(
            "INSERT INTO users (id, email, full_name, password_hash, plan_type, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            (
                user.id.as_str(),
                user.email.as_str(),
                user.full_name.clone(),
                user.password_hash.as_str(),
                user.plan_type.as_str(),
                app_state.clock.unix_now(),
            ),
        )
        .await
        .map_err(|_| db_error_with_context("user creation failed"))?;
    }

    start_session(&session, &user).await?;
    tracing::info!(user_id = %user.id, "user registered");

    Ok((StatusCode::CREATED, Json(PublicUser::from(&user))))
}

pub async fn login(
    State(app_state): State<AppState>,
    session: Session,
    Json(payload): Json<LoginPayload>,
) -> Result<(StatusCode, Json<PublicUser>), (StatusCode, String)> {
    let invalid = || {
        (
            StatusCode::UNAUTHORIZED,
            "Invalid email or password".to_string(),
        )
    };

    let email = normalize_email(&payload.email).map_err(|_| invalid())?;
    let user = find_user_by_email(&app_state.db, &email)
        .await?
        .ok_or_else(invalid)?;

    if !verify_password(&payload.password, &user.password_hash) {
        tracing::info!(user_id = %user.id, "failed login");
        return Err(invalid());
    }

    start_session(&session, &user).await?;
    tracing::debug!(user_id = %user.id, "user logged in");

    Ok((StatusCode::OK, Json(PublicUser::from(&user))))
}

pub async fn me(
    State(app_state): State<AppState>,
    session: Session,
) -> Result<(StatusCode, Json<PublicUser>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    Ok((StatusCode::OK, Json(PublicUser::from(&user))))
}

pub async fn logout(
    State(app_state): State<AppState>,
    session: Session,
) -> Result<StatusCode, (StatusCode, String)> {
    if let Ok(user) = get_current_user(&session).await {
        app_state.subscriptions.forget(&user.id).await;
    }

    session.flush().await.map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to clear session".to_string(),
        )
    })?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("hunter22").unwrap();
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
        assert!(!verify_password("hunter22", "not-a-hash"));
    }
}
