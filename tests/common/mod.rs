#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode},
};
use saldus_server::{
    AppState,
    billing::{BillingBackend, BillingError, BillingIdentity, CheckoutSession, SubscriptionInfo},
    clock::ManualClock,
    constants::*,
    database,
    models::{PlanType, User},
    recovery::RecoveryMailer,
    routes,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use time::{Duration, OffsetDateTime, macros::datetime};
use tower::util::ServiceExt;
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::Key};

/// Wall clock every test starts at.
pub const START: OffsetDateTime = datetime!(2024-01-15 12:00 UTC);

/// Billing backend whose answers are set per email by the test.
#[derive(Default)]
pub struct StubBilling {
    plans: Mutex<HashMap<String, PlanType>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl StubBilling {
    pub fn set_plan(&self, email: &str, plan: PlanType) {
        self.plans.lock().unwrap().insert(email.to_string(), plan);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingBackend for StubBilling {
    async fn check_subscription(
        &self,
        identity: &BillingIdentity,
    ) -> Result<SubscriptionInfo, BillingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Api {
                status: 500,
                message: "processor unavailable".to_string(),
            });
        }

        let plan = self
            .plans
            .lock()
            .unwrap()
            .get(&identity.email)
            .copied()
            .unwrap_or_default();
        Ok(SubscriptionInfo {
            subscribed: plan.is_pro(),
            plan_type: plan,
            plan_expiry_date: plan.is_pro().then(|| "2024-02-15T12:00:00Z".to_string()),
            customer_id: Some(format!("cus_{}", identity.user_id)),
        })
    }

    async fn create_checkout(
        &self,
        identity: &BillingIdentity,
        origin: &str,
    ) -> Result<CheckoutSession, BillingError> {
        Ok(CheckoutSession {
            url: format!("https://checkout.test/{}?from={}", identity.user_id, origin),
            customer_id: format!("cus_{}", identity.user_id),
        })
    }

    async fn customer_portal(
        &self,
        identity: &BillingIdentity,
        origin: &str,
    ) -> Result<String, BillingError> {
        let customer = identity
            .customer_id
            .as_deref()
            .ok_or(BillingError::MissingCustomer)?;
        Ok(format!("https://portal.test/{}?return={}/settings", customer, origin))
    }
}

/// Keeps every reset token handed out, keyed by email.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMailer {
    pub fn last_token_for(&self, email: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, token)| token.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl RecoveryMailer for RecordingMailer {
    async fn send_reset(
        &self,
        user: &User,
        token: &str,
        _expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((user.email.clone(), token.to_string()));
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub billing: Arc<StubBilling>,
    pub mailer: Arc<RecordingMailer>,
    pub clock: Arc<ManualClock>,
}

pub async fn setup_test_app() -> anyhow::Result<TestApp> {
    let temp_dir = tempfile::tempdir()?;
    let data_path = temp_dir.path().to_string_lossy().to_string();
    // keep the directory for the lifetime of the test process
    std::mem::forget(temp_dir);

    let db = database::init_db(&data_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize database: {}", e))?;

    let billing = Arc::new(StubBilling::default());
    let mailer = Arc::new(RecordingMailer::default());
    let clock = Arc::new(ManualClock::new(START));

    let state = AppState::new(
        db,
        billing.clone(),
        mailer.clone(),
        clock.clone(),
        "http://localhost:8080".to_string(),
    );

    let session_secret = "test_secret_key_at_least_64_chars_long_test_secret_key_at_least_64_";
    let session_key = Key::try_from(session_secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid session secret: {}", e))?;

    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_name(SESSION_NAME)
        .with_expiry(Expiry::OnInactivity(Duration::days(SESSION_EXPIRY_DAYS)))
        .with_signed(session_key);

    let router = routes::router(state.clone()).layer(session_layer);

    Ok(TestApp {
        router,
        state,
        billing,
        mailer,
        clock,
    })
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|e| panic!("invalid json body {:?}: {}", self.body, e))
    }

    /// `name=value` part of the session cookie, if one was set.
    pub fn session_cookie(&self) -> Option<String> {
        self.headers
            .get("set-cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(str::to_string)
    }
}

pub async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    cookie: Option<&str>,
    body: Option<serde_json::Value>,
) -> anyhow::Result<TestResponse> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(cookie) = cookie {
        builder = builder.header("cookie", cookie);
    }
    let request = builder
        .body(match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        })
        .map_err(|e| anyhow::anyhow!("Failed to build request: {}", e))?;

    let response = app
        .clone()
        .oneshot(request)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to execute request: {}", e))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read response body: {}", e))?;

    Ok(TestResponse {
        status,
        headers,
        body: String::from_utf8(body.to_vec())?,
    })
}

pub async fn auth_request(
    app: &Router,
    method: &str,
    uri: &str,
    cookie: &str,
    body: Option<serde_json::Value>,
) -> anyhow::Result<TestResponse> {
    send(app, method, uri, Some(cookie), body).await
}

/// Registers a user and returns the session cookie.
pub async fn register_user(app: &Router, email: &str, password: &str) -> anyhow::Result<String> {
    let response = send(
        app,
        "POST",
        "/auth/register",
        None,
        Some(serde_json::json!({
            "email": email,
            "password": password,
            "full_name": "Test User"
        })),
    )
    .await?;

    if response.status != StatusCode::CREATED {
        anyhow::bail!("register failed: {} {}", response.status, response.body);
    }
    response
        .session_cookie()
        .ok_or_else(|| anyhow::anyhow!("No session cookie in response"))
}

pub async fn login_user(app: &Router, email: &str, password: &str) -> anyhow::Result<String> {
    let response = send(
        app,
        "POST",
        "/auth/login",
        None,
        Some(serde_json::json!({ "email": email, "password": password })),
    )
    .await?;

    if response.status != StatusCode::OK {
        anyhow::bail!("login failed: {} {}", response.status, response.body);
    }
    response
        .session_cookie()
        .ok_or_else(|| anyhow::anyhow!("No session cookie in response"))
}

/// Registers a user whose billing lookups report an active Pro subscription.
pub async fn register_pro_user(test_app: &TestApp, email: &str) -> anyhow::Result<String> {
    test_app.billing.set_plan(email, PlanType::Pro);
    register_user(&test_app.router, email, "password123").await
}

pub async fn create_transaction(
    app: &Router,
    cookie: &str,
    kind: &str,
    amount: f64,
    category: &str,
    date: &str,
) -> anyhow::Result<TestResponse> {
    auth_request(
        app,
        "POST",
        "/transactions",
        cookie,
        Some(serde_json::json!({
            "type": kind,
            "amount": amount,
            "category": category,
            "date": date
        })),
    )
    .await
}
