//! Payment-processor gateway: subscription check, checkout and customer portal.

use async_trait::async_trait;
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tower_sessions::Session;

use crate::AppState;
use crate::auth::current_account;
use crate::config::StripeConfig;
use crate::models::{PlanType, UrlResponse, User};
use crate::utils::db_error_with_context;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("billing is not configured")]
    NotConfigured,
    #[error("payment processor request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("payment processor returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("no billing customer on file for this account")]
    MissingCustomer,
    #[error("unexpected payment processor response: {0}")]
    InvalidResponse(String),
}

/// Who is being billed, plus what the store already knows about them.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingIdentity {
    pub user_id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub known_plan: Option<PlanType>,
    pub customer_id: Option<String>,
}

impl From<&User> for BillingIdentity {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id.clone(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            known_plan: Some(user.plan_type),
            customer_id: user.stripe_customer_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub subscribed: bool,
    pub plan_type: PlanType,
    pub plan_expiry_date: Option<String>,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub url: String,
    pub customer_id: String,
}

#[async_trait]
pub trait BillingBackend: Send + Sync {
    async fn check_subscription(
        &self,
        identity: &BillingIdentity,
    ) -> Result<SubscriptionInfo, BillingError>;

    async fn create_checkout(
        &self,
        identity: &BillingIdentity,
        origin: &str,
    ) -> Result<CheckoutSession, BillingError>;

    async fn customer_portal(
        &self,
        identity: &BillingIdentity,
        origin: &str,
    ) -> Result<String, BillingError>;
}

/// Used when no processor key is configured. Subscription checks fail, so
/// the resolver falls back to the plan stored on the user.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredBilling;

#[async_trait]
impl BillingBackend for UnconfiguredBilling {
    async fn check_subscription(
        &self,
        _identity: &BillingIdentity,
    ) -> Result<SubscriptionInfo, BillingError> {
        Err(BillingError::NotConfigured)
    }

    async fn create_checkout(
        &self,
        _identity: &BillingIdentity,
        _origin: &str,
    ) -> Result<CheckoutSession, BillingError> {
        Err(BillingError::NotConfigured)
    }

    async fn customer_portal(
        &self,
        _identity: &BillingIdentity,
        _origin: &str,
    ) -> Result<String, BillingError> {
        Err(BillingError::NotConfigured)
    }
}

#[derive(Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct StripeCustomer {
    id: String,
}

#[derive(Deserialize)]
struct StripeSubscription {
    current_period_end: Option<i64>,
}

#[derive(Deserialize)]
struct StripeSession {
    url: Option<String>,
}

#[derive(Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

/// Stripe REST client covering customers, subscriptions, checkout and portal.
#[derive(Clone)]
pub struct StripeBilling {
    http: Client,
    secret_key: String,
    price_id: String,
    api_base: String,
}

impl StripeBilling {
    pub fn new(http: Client, config: &StripeConfig) -> Self {
        Self {
            http,
            secret_key: config.secret_key.clone(),
            price_id: config.price_id.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BillingError> {
        let response = request.bearer_auth(&self.secret_key).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StripeErrorBody>(&body)
                .ok()
                .and_then(|parsed| parsed.error.message)
                .unwrap_or(body);
            return Err(BillingError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<T>().await?)
    }

    async fn find_customer(&self, email: &str) -> Result<Option<String>, BillingError> {
        let customers: StripeList<StripeCustomer> = self
            .send(
                self.http
                    .get(self.url("customers"))
                    .query(&[("email", email), ("limit", "1")]),
            )
            .await?;
        Ok(customers.data.into_iter().next().map(|c| c.id))
    }

    async fn create_customer(&self, identity: &BillingIdentity) -> Result<String, BillingError> {
        let mut form = vec![
            ("email", identity.email.clone()),
            ("metadata[user_id]", identity.user_id.clone()),
        ];
        if let Some(name) = &identity.full_name {
            form.push(("name", name.clone()));
        }

        let customer: StripeCustomer = self
            .send(self.http.post(self.url("customers")).form(&form))
            .await?;
        tracing::info!(user_id = %identity.user_id, customer_id = %customer.id, "created billing customer");
        Ok(customer.id)
    }

    async fn resolve_customer(
        &self,
        identity: &BillingIdentity,
    ) -> Result<Option<String>, BillingError> {
        match &identity.customer_id {
            Some(id) => Ok(Some(id.clone())),
            None => self.find_customer(&identity.email).await,
        }
    }
}

fn format_unix(timestamp: i64) -> Result<String, BillingError> {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .map_err(|e| BillingError::InvalidResponse(e.to_string()))?
        .format(&Rfc3339)
        .map_err(|e| BillingError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl BillingBackend for StripeBilling {
    async fn check_subscription(
        &self,
        identity: &BillingIdentity,
    ) -> Result<SubscriptionInfo, BillingError> {
        let Some(customer_id) = self.resolve_customer(identity).await? else {
            return Ok(SubscriptionInfo {
                subscribed: false,
                plan_type: PlanType::Free,
                plan_expiry_date: None,
                customer_id: None,
            });
        };

        let subscriptions: StripeList<StripeSubscription> = self
            .send(self.http.get(self.url("subscriptions")).query(&[
                ("customer", customer_id.as_str()),
                ("status", "active"),
                ("limit", "1"),
            ]))
            .await?;

        let info = match subscriptions.data.into_iter().next() {
            Some(subscription) => SubscriptionInfo {
                subscribed: true,
                plan_type: PlanType::Pro,
                plan_expiry_date: subscription
                    .current_period_end
                    .map(format_unix)
                    .transpose()?,
                customer_id: Some(customer_id),
            },
            None => SubscriptionInfo {
                subscribed: false,
                plan_type: PlanType::Free,
                plan_expiry_date: None,
                customer_id: Some(customer_id),
            },
        };
        Ok(info)
    }

    async fn create_checkout(
        &self,
        identity: &BillingIdentity,
        origin: &str,
    ) -> Result<CheckoutSession, BillingError> {
        let customer_id = match self.resolve_customer(identity).await? {
            Some(id) => id,
            None => self.create_customer(identity).await?,
        };

        let success_url = format!("{}/dashboard?checkout=success", origin);
        let cancel_url = format!("{}/dashboard?checkout=cancelled", origin);
        let form = [
            ("customer", customer_id.as_str()),
            ("mode", "subscription"),
            ("line_items[0][price]", self.price_id.as_str()),
            ("line_items[0][quantity]", "1"),
            ("allow_promotion_codes", "true"),
            ("success_url", success_url.as_str()),
            ("cancel_url", cancel_url.as_str()),
        ];

        let session: StripeSession = self
            .send(self.http.post(self.url("checkout/sessions")).form(&form))
            .await?;
        let url = session
            .url
            .ok_or_else(|| BillingError::InvalidResponse("checkout session has no url".into()))?;

        Ok(CheckoutSession { url, customer_id })
    }

    async fn customer_portal(
        &self,
        identity: &BillingIdentity,
        origin: &str,
    ) -> Result<String, BillingError> {
        let customer_id = identity
            .customer_id
            .as_deref()
            .ok_or(BillingError::MissingCustomer)?;
        let return_url = format!("{}/settings", origin);

        let session: StripeSession = self
            .send(self.http.post(self.url("billing_portal/sessions")).form(&[
                ("customer", customer_id),
                ("return_url", return_url.as_str()),
            ]))
            .await?;

        session
            .url
            .ok_or_else(|| BillingError::InvalidResponse("portal session has no url".into()))
    }
}

fn billing_error(e: BillingError) -> (StatusCode, String) {
    tracing::warn!(error = %e, "billing request failed");
    let status = match e {
        BillingError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::MissingCustomer => StatusCode::CONFLICT,
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string())
}

/// Browser origin for redirect URLs, falling back to the configured frontend.
fn request_origin(headers: &HeaderMap, fallback: &str) -> String {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
        .trim_end_matches('/')
        .to_string()
}

pub async fn create_checkout(
    State(app_state): State<AppState>,
    session: Session,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<UrlResponse>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    let identity = BillingIdentity::from(&user);
    let origin = request_origin(&headers, &app_state.frontend_origin);

    let checkout = app_state
        .billing
        .create_checkout(&identity, &origin)
        .await
        .map_err(billing_error)?;

    if identity.customer_id.as_deref() != Some(checkout.customer_id.as_str()) {
        let conn = app_state.db.write().await;
        conn.execute(
            "UPDATE users SET stripe_customer_id = ? WHERE id = ?",
            (checkout.customer_id.as_str(), user.id.as_str()),
        )
        .await
        .map_err(|_| db_error_with_context("failed to store billing customer"))?;
    }

    Ok((StatusCode::OK, Json(UrlResponse { url: checkout.url })))
}

pub async fn open_customer_portal(
    State(app_state): State<AppState>,
    session: Session,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<UrlResponse>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    let identity = BillingIdentity::from(&user);
    let origin = request_origin(&headers, &app_state.frontend_origin);

    let url = app_state
        .billing
        .customer_portal(&identity, &origin)
        .await
        .map_err(billing_error)?;

    Ok((StatusCode::OK, Json(UrlResponse { url })))
}
