//! Password recovery through a security question.
//!
//! The user picks a question from a fixed list and records an answer plus
//! three decoys. Recovery shows the answer mixed among the decoys; a wrong
//! pick locks recovery for an hour. A right pick issues a one-hour reset token
//! that is delivered out of band through a [`RecoveryMailer`].

use async_trait::async_trait;
use axum::{Json, extract::State, http::StatusCode};
use lettre::message::{Mailbox, Message, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use std::sync::Arc;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tower_sessions::Session;
use uuid::Uuid;

use crate::auth::{current_account, find_user_by_email, hash_password};
use crate::config::SmtpConfig;
use crate::constants::*;
use crate::models::{
    MessageResponse, RecoveryAnswerPayload, RecoveryQuestionPayload, RecoveryQuestionResponse,
    ResetPasswordPayload, SecuritySetupPayload, User,
};
use crate::utils::{
    db_error, db_error_with_context, normalize_email, validate_password, validate_string_length,
};
use crate::{AppState, Db, TransactionError, with_transaction};

/// Delivers reset tokens to the account owner.
#[async_trait]
pub trait RecoveryMailer: Send + Sync {
    async fn send_reset(
        &self,
        user: &User,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()>;
}

/// Writes the delivery to the log. Only used when no SMTP server is
/// configured, so no reset link ever reaches the user.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl RecoveryMailer for LogMailer {
    async fn send_reset(
        &self,
        user: &User,
        _token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        tracing::info!(user_id = %user.id, email = %user.email, %expires_at, "password reset token issued");
        Ok(())
    }
}

/// Mails the reset link through an SMTP relay.
pub struct SmtpMailer {
    transport: Arc<SmtpTransport>,
    from: Mailbox,
    frontend_origin: String,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig, frontend_origin: &str) -> anyhow::Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid SMTP_FROM '{}': {}", config.from, e))?;

        let mut builder = if config.use_tls {
            SmtpTransport::relay(&config.host)?.port(config.port)
        } else {
            SmtpTransport::builder_dangerous(&config.host).port(config.port)
        };
        if let Some(username) = &config.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: Arc::new(builder.build()),
            from,
            frontend_origin: frontend_origin.trim_end_matches('/').to_string(),
        })
    }

    pub fn reset_link(&self, token: &str) -> String {
        format!("{}/reset-password?token={}", self.frontend_origin, token)
    }

    pub fn reset_message(
        &self,
        user: &User,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<Message> {
        let to: Mailbox = user.email.parse()?;
        let greeting = match user.full_name.as_deref() {
            Some(name) => format!("Hi {},", name),
            None => "Hi,".to_string(),
        };
        let body = format!(
            "{}\n\nUse the link below to choose a new password:\n\n{}\n\nThe link expires at {}. If you did not ask for this, ignore this email.\n",
            greeting,
            self.reset_link(token),
            expires_at.format(&Rfc3339)?
        );

        Ok(Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(RESET_EMAIL_SUBJECT)
            .header(ContentType::TEXT_PLAIN)
            .body(body)?)
    }
}

#[async_trait]
impl RecoveryMailer for SmtpMailer {
    async fn send_reset(
        &self,
        user: &User,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        let message = self.reset_message(user, token, expires_at)?;
        let transport = self.transport.clone();

        tokio::task::spawn_blocking(move || transport.send(&message)).await??;
        tracing::info!(user_id = %user.id, "password reset email sent");
        Ok(())
    }
}

enum RecoveryWriteError {
    Transaction(TransactionError),
    Db(&'static str),
}

impl From<TransactionError> for RecoveryWriteError {
    fn from(value: TransactionError) -> Self {
        Self::Transaction(value)
    }
}

impl From<RecoveryWriteError> for (StatusCode, String) {
    fn from(value: RecoveryWriteError) -> Self {
        match value {
            RecoveryWriteError::Transaction(TransactionError::Begin) => {
                db_error_with_context("failed to begin transaction")
            }
            RecoveryWriteError::Transaction(TransactionError::Commit) => {
                db_error_with_context("failed to commit transaction")
            }
            RecoveryWriteError::Db(ctx) => db_error_with_context(ctx),
        }
    }
}

pub fn normalize_answer(answer: &str) -> String {
    answer.trim().to_lowercase()
}

/// Unlock time if the last failed attempt is still inside the cool-down.
pub fn locked_until(last_failed_at: Option<i64>, now: i64) -> Option<i64> {
    last_failed_at
        .map(|at| at + RECOVERY_COOLDOWN_SECONDS)
        .filter(|until| *until > now)
}

/// Real answer mixed among the decoys. Sorted so the position says nothing.
pub fn recovery_options(answer: &str, fake_answers: &[String]) -> Vec<String> {
    let mut options: Vec<String> = fake_answers.to_vec();
    options.push(answer.to_string());
    options.sort();
    options.dedup();
    options
}

fn format_unix(timestamp: i64) -> String {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| timestamp.to_string())
}

async fn last_failed_attempt(db: &Db, user_id: &str) -> Result<Option<i64>, (StatusCode, String)> {
    let conn = db.read().await;
    let mut rows = conn
        .query(
            "SELECT MAX(attempt_time) FROM security_attempts WHERE user_id = ? AND successful = 0",
            [user_id],
        )
        .await
        .map_err(|_| db_error_with_context("failed to check recovery attempts"))?;

    match rows.next().await.map_err(|_| db_error())? {
        Some(row) => row.get::<Option<i64>>(0).map_err(|_| db_error()),
        None => Ok(None),
    }
}

async fn ensure_not_locked(db: &Db, user_id: &str, now: i64) -> Result<(), (StatusCode, String)> {
    if let Some(until) = locked_until(last_failed_attempt(db, user_id).await?, now) {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "Too many failed attempts. Try again later (after {}).",
                format_unix(until)
            ),
        ));
    }
    Ok(())
}

async fn load_security(
    db: &Db,
    user_id: &str,
) -> Result<(Option<String>, Option<String>, Vec<String>), (StatusCode, String)> {
    let conn = db.read().await;

    let mut rows = conn
        .query(
            "SELECT security_question, security_answer FROM users WHERE id = ?",
            [user_id],
        )
        .await
        .map_err(|_| db_error_with_context("failed to load security question"))?;
    let (question, answer) = match rows.next().await.map_err(|_| db_error())? {
        Some(row) => (
            row.get::<Option<String>>(0).map_err(|_| db_error())?,
            row.get::<Option<String>>(1).map_err(|_| db_error())?,
        ),
        None => (None, None),
    };

    let mut rows = conn
        .query(
            "SELECT fake_answer FROM fake_answers WHERE user_id = ?",
            [user_id],
        )
        .await
        .map_err(|_| db_error_with_context("failed to load recovery options"))?;
    let mut fakes = Vec::new();
    while let Some(row) = rows.next().await.map_err(|_| db_error())? {
        fakes.push(row.get::<String>(0).map_err(|_| db_error())?);
    }

    Ok((question, answer, fakes))
}

pub async fn set_security_question(
    State(app_state): State<AppState>,
    session: Session,
    Json(payload): Json<SecuritySetupPayload>,
) -> Result<(StatusCode, Json<MessageResponse>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;

    let question = payload.question.trim().to_string();
    if !SECURITY_QUESTIONS.contains(&question.as_str()) {
        return Err((
            StatusCode::BAD_REQUEST,
            "Unknown security question".to_string(),
        ));
    }

    validate_string_length(&payload.answer, "Answer", MAX_ANSWER_LENGTH)?;
    let answer = normalize_answer(&payload.answer);

    if payload.fake_answers.len() != REQUIRED_FAKE_ANSWERS {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Exactly {} decoy answers are required", REQUIRED_FAKE_ANSWERS),
        ));
    }
    let mut fakes = Vec::with_capacity(REQUIRED_FAKE_ANSWERS);
    for fake in &payload.fake_answers {
        validate_string_length(fake, "Decoy answer", MAX_ANSWER_LENGTH)?;
        let fake = normalize_answer(fake);
        if fake == answer || fakes.contains(&fake) {
            return Err((
                StatusCode::BAD_REQUEST,
                "Decoy answers must differ from each other and from the answer".to_string(),
            ));
        }
        fakes.push(fake);
    }

    let user_id = user.id.clone();
    with_transaction(&app_state.db, |conn| {
        Box::pin(async move {
            conn.execute(
                "UPDATE users SET security_question = ?, security_answer = ? WHERE id = ?",
                (question.as_str(), answer.as_str(), user_id.as_str()),
            )
            .await
            .map_err(|_| RecoveryWriteError::Db("failed to store security question"))?;

            conn.execute("DELETE FROM fake_answers WHERE user_id = ?", [user_id.as_str()])
                .await
                .map_err(|_| RecoveryWriteError::Db("failed to replace decoy answers"))?;

            for fake in &fakes {
                conn.execute(
                    "INSERT INTO fake_answers (id, user_id, fake_answer) VALUES (?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        user_id.as_str(),
                        fake.as_str(),
                    ),
                )
                .await
                .map_err(|_| RecoveryWriteError::Db("failed to store decoy answer"))?;
            }

            Ok::<(), RecoveryWriteError>(())
        })
    })
    .await?;

    Ok((
        StatusCode::OK,
        Json(MessageResponse {
            message: "Security question saved".to_string(),
        }),
    ))
}

async fn find_recovery_user(db: &Db, email: &str) -> Result<User, (StatusCode, String)> {
    let email = normalize_email(email)?;
    find_user_by_email(db, &email).await?.ok_or((
        StatusCode::NOT_FOUND,
        "No account found with this email".to_string(),
    ))
}

pub async fn recovery_question(
    State(app_state): State<AppState>,
    Json(payload): Json<RecoveryQuestionPayload>,
) -> Result<(StatusCode, Json<RecoveryQuestionResponse>), (StatusCode, String)> {
    let user = find_recovery_user(&app_state.db, &payload.email).await?;
    ensure_not_locked(&app_state.db, &user.id, app_state.clock.unix_now()).await?;

    let (question, answer, fakes) = load_security(&app_state.db, &user.id).await?;
    let (Some(question), Some(answer)) = (question, answer) else {
        return Err((
            StatusCode::CONFLICT,
            "No security question is set up for this account".to_string(),
        ));
    };
    if !SECURITY_QUESTIONS.contains(&question.as_str()) {
        return Err((
            StatusCode::CONFLICT,
            "The security question on this account is no longer supported".to_string(),
        ));
    }
    if fakes.len() < REQUIRED_FAKE_ANSWERS {
        return Err((
            StatusCode::CONFLICT,
            "Security answers are incomplete for this account".to_string(),
        ));
    }

    Ok((
        StatusCode::OK,
        Json(RecoveryQuestionResponse {
            question,
            options: recovery_options(&answer, &fakes),
        }),
    ))
}

pub async fn recovery_answer(
    State(app_state): State<AppState>,
    Json(payload): Json<RecoveryAnswerPayload>,
) -> Result<(StatusCode, Json<MessageResponse>), (StatusCode, String)> {
    let user = find_recovery_user(&app_state.db, &payload.email).await?;
    let now = app_state.clock.unix_now();
    ensure_not_locked(&app_state.db, &user.id, now).await?;

    let (_, answer, _) = load_security(&app_state.db, &user.id).await?;
    let Some(answer) = answer else {
        return Err((
            StatusCode::CONFLICT,
            "No security question is set up for this account".to_string(),
        ));
    };
    let correct = normalize_answer(&payload.answer) == answer;

    {
        let conn = app_state.db.write().await;
        conn.execute(
            "INSERT INTO security_attempts (id, user_id, successful, attempt_time) VALUES (?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                user.id.as_str(),
                correct,
                now,
            ),
        )
        .await
        .map_err(|_| db_error_with_context("failed to record recovery attempt"))?;
    }

    if !correct {
        tracing::info!(user_id = %user.id, "wrong recovery answer");
        return Err((
            StatusCode::FORBIDDEN,
            "Incorrect answer. Try again in 1 hour.".to_string(),
        ));
    }

    let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let expires_at = now + RESET_TOKEN_TTL_SECONDS;
    {
        let conn = app_state.db.write().await;
        conn.execute(
            "INSERT INTO password_resets (id, user_id, reset_token, expires_at, used) VALUES (?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                user.id.as_str(),
                token.as_str(),
                expires_at,
                false,
            ),
        )
        .await
        .map_err(|_| db_error_with_context("failed to create reset token"))?;
    }

    let expires = OffsetDateTime::from_unix_timestamp(expires_at).map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Invalid reset expiry".to_string(),
        )
    })?;
    app_state
        .mailer
        .send_reset(&user, &token, expires)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %user.id, error = %e, "failed to deliver reset token");
            (
                StatusCode::BAD_GATEWAY,
                "Failed to deliver recovery instructions".to_string(),
            )
        })?;

    Ok((
        StatusCode::OK,
        Json(MessageResponse {
            message: "Recovery instructions have been sent".to_string(),
        }),
    ))
}

pub async fn reset_password(
    State(app_state): State<AppState>,
    Json(payload): Json<ResetPasswordPayload>,
) -> Result<(StatusCode, Json<MessageResponse>), (StatusCode, String)> {
    validate_password(&payload.new_password)?;
    let now = app_state.clock.unix_now();

    let user_id: String = {
        let conn = app_state.db.read().await;
        let mut rows = conn
            .query(
                "SELECT user_id FROM password_resets WHERE reset_token = ? AND used = 0 AND expires_at > ?",
                (payload.token.trim(), now),
            )
            .await
            .map_err(|_| db_error_with_context("failed to check reset token"))?;

        match rows.next().await.map_err(|_| db_error())? {
            Some(row) => row.get(0).map_err(|_| db_error())?,
            None => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    "Invalid or expired reset token".to_string(),
                ));
            }
        }
    };

    let password_hash = hash_password(&payload.new_password)?;
    let token = payload.token.trim().to_string();

    with_transaction(&app_state.db, |conn| {
        Box::pin(async move {
            conn.execute(
                "UPDATE users SET password_hash = ? WHERE id = ?",
                (password_hash.as_str(), user_id.as_str()),
            )
            .await
            .map_err(|_| RecoveryWriteError::Db("failed to update password"))?;

            conn.execute(
                "UPDATE password_resets SET used = 1 WHERE reset_token = ?",
                [token.as_str()],
            )
            .await
            .map_err(|_| RecoveryWriteError::Db("failed to consume reset token"))?;

            Ok::<(), RecoveryWriteError>(())
        })
    })
    .await?;

    Ok((
        StatusCode::OK,
        Json(MessageResponse {
            message: "Password updated".to_string(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PlanType;
    use time::macros::datetime;

    fn smtp_config(port: u16) -> SmtpConfig {
        SmtpConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: Some("saldus".to_string()),
            password: "secret".to_string(),
            from: "Saldus <no-reply@saldus.test>".to_string(),
            use_tls: false,
        }
    }

    fn user() -> User {
        User {
            id: "u1".to_string(),
            email: "ana@example.com".to_string(),
            full_name: Some("Ana".to_string()),
            password_hash: String::new(),
            plan_type: PlanType::Free,
            plan_expiry_date: None,
            stripe_customer_id: None,
        }
    }

    #[test]
    fn cooldown_lasts_one_hour() {
        let failed_at = 10_000;
        let unlock = Some(failed_at + 3600);
        assert_eq!(locked_until(Some(failed_at), failed_at + 1), unlock);
        assert_eq!(locked_until(Some(failed_at), failed_at + 3599), unlock);
        assert_eq!(locked_until(Some(failed_at), failed_at + 3600), None);
        assert_eq!(locked_until(None, failed_at), None);
    }

    #[test]
    fn options_are_sorted_and_include_answer() {
        let fakes = vec!["rex".to_string(), "buddy".to_string(), "max".to_string()];
        let options = recovery_options("fido", &fakes);
        assert_eq!(options, vec!["buddy", "fido", "max", "rex"]);
    }

    #[test]
    fn answers_compare_case_insensitively() {
        assert_eq!(normalize_answer("  Fido "), "fido");
    }

    #[test]
    fn reset_message_is_addressed_to_the_user() {
        let mailer = SmtpMailer::new(&smtp_config(2525), "http://localhost:8080/").unwrap();
        assert_eq!(
            mailer.reset_link("abc123"),
            "http://localhost:8080/reset-password?token=abc123"
        );

        let message = mailer
            .reset_message(&user(), "abc123", datetime!(2024-01-15 13:00 UTC))
            .unwrap();
        let to: Vec<&str> = message.envelope().to().iter().map(|a| a.as_ref()).collect();
        assert_eq!(to, vec!["ana@example.com"]);
        assert_eq!(
            message.envelope().from().map(|a| a.as_ref()),
            Some("no-reply@saldus.test")
        );

        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Reset your Saldus password"));
    }

    #[test]
    fn invalid_sender_is_rejected() {
        let mut config = smtp_config(2525);
        config.from = "not an address".to_string();
        assert!(SmtpMailer::new(&config, "http://localhost:8080").is_err());
    }

    #[tokio::test]
    async fn unreachable_server_reports_failure() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mailer = SmtpMailer::new(&smtp_config(port), "http://localhost:8080").unwrap();

        let result = mailer
            .send_reset(&user(), "abc123", datetime!(2024-01-15 13:00 UTC))
            .await;
        assert!(result.is_err());
    }
}
