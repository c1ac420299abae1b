//! Cached subscription state per signed-in user.
//!
//! A [`SubscriptionResolver`] holds the last plan fetched from the billing
//! backend for one identity and walks `Unknown -> Pending -> Resolved -> Stale`.
//! Refreshes never overlap: while one is in flight further calls are no-ops.
//! A failed check still resolves to a concrete plan (the one stored on the
//! user, else free) and keeps the error message for display.
//!
//! [`SubscriptionRegistry`] keeps one resolver per user, bounded with LRU
//! eviction, polls them on a timer and writes resolved plans back to the
//! `users` row so the next fallback is as fresh as possible. Users that have
//! not made a request for a while are dropped instead of polled.

use axum::{Json, extract::State, http::StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tower_sessions::Session;

use crate::auth::current_account;
use crate::billing::{BillingBackend, BillingIdentity};
use crate::clock::Clock;
use crate::constants::*;
use crate::models::{PlanType, SubscriptionStatus};
use crate::{AppState, Db};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    /// No value fetched for the current identity yet.
    Unknown,
    /// A remote check is in flight.
    Pending,
    Resolved,
    /// Resolved, but older than the staleness window.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Completed {
        status: SubscriptionStatus,
        customer_id: Option<String>,
    },
    /// Another refresh was already in flight.
    Skipped,
    /// Cached value is still fresh.
    NotNeeded,
    NoIdentity,
    /// The identity changed while the call was in flight.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutOutcome {
    Success,
    Cancelled,
}

impl CheckoutOutcome {
    pub fn parse(marker: &str) -> Option<Self> {
        match marker.trim() {
            CHECKOUT_SUCCESS => Some(CheckoutOutcome::Success),
            CHECKOUT_CANCELLED => Some(CheckoutOutcome::Cancelled),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ResolverState {
    identity: Option<BillingIdentity>,
    generation: u64,
    value: SubscriptionStatus,
    fetched_at: Option<OffsetDateTime>,
    in_flight: bool,
}

pub struct SubscriptionResolver {
    backend: Arc<dyn BillingBackend>,
    clock: Arc<dyn Clock>,
    state: Mutex<ResolverState>,
}

/// Clears the in-flight flag if a refresh future is dropped before finishing.
struct InFlightGuard<'a> {
    resolver: &'a SubscriptionResolver,
    generation: u64,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.resolver.lock();
            if state.generation == self.generation {
                state.in_flight = false;
            }
        }
    }
}

impl SubscriptionResolver {
    pub fn new(backend: Arc<dyn BillingBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            state: Mutex::new(ResolverState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn identity(&self) -> Option<BillingIdentity> {
        self.lock().identity.clone()
    }

    /// Switches the tracked user. A different user (or none) resets the cache
    /// to the free default immediately; returns whether a refresh is due.
    /// Passing the same user only refreshes what is known about them.
    pub fn switch_identity(&self, identity: Option<BillingIdentity>) -> bool {
        let mut state = self.lock();

        let same_user = match (&state.identity, &identity) {
            (Some(current), Some(next)) => current.user_id == next.user_id,
            (None, None) => true,
            _ => false,
        };
        if same_user {
            if identity.is_some() {
                state.identity = identity;
            }
            return false;
        }

        state.generation += 1;
        state.identity = identity;
        state.value = SubscriptionStatus::default();
        state.fetched_at = None;
        state.in_flight = false;
        state.identity.is_some()
    }

    pub fn phase(&self) -> SubscriptionPhase {
        let state = self.lock();
        if state.in_flight {
            return SubscriptionPhase::Pending;
        }
        match state.fetched_at {
            None => SubscriptionPhase::Unknown,
            Some(fetched_at) => {
                let age = self.clock.now() - fetched_at;
                if age >= time::Duration::seconds(SUBSCRIPTION_STALE_SECONDS) {
                    SubscriptionPhase::Stale
                } else {
                    SubscriptionPhase::Resolved
                }
            }
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        let state = self.lock();
        let mut status = state.value.clone();
        status.is_loading =
            state.in_flight || (state.identity.is_some() && state.fetched_at.is_none());
        status
    }

    /// Plan from the last completed check, if any for this identity.
    pub fn resolved_plan(&self) -> Option<PlanType> {
        let state = self.lock();
        state.fetched_at.map(|_| state.value.plan_type)
    }

    /// Runs one remote check unless one is already in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        let (identity, generation) = {
            let mut state = self.lock();
            let Some(identity) = state.identity.clone() else {
                return RefreshOutcome::NoIdentity;
            };
            if state.in_flight {
                return RefreshOutcome::Skipped;
            }
            state.in_flight = true;
            (identity, state.generation)
        };

        let mut guard = InFlightGuard {
            resolver: self,
            generation,
            armed: true,
        };
        let result = self.backend.check_subscription(&identity).await;
        guard.armed = false;

        let mut state = self.lock();
        if state.generation != generation {
            tracing::debug!(user_id = %identity.user_id, "discarding subscription result for previous user");
            return RefreshOutcome::Discarded;
        }

        state.in_flight = false;
        state.fetched_at = Some(self.clock.now());

        let customer_id = match result {
            Ok(info) => {
                state.value = SubscriptionStatus {
                    subscribed: info.subscribed,
                    plan_type: info.plan_type,
                    plan_expiry_date: info.plan_expiry_date,
                    is_loading: false,
                    error: None,
                };
                info.customer_id
            }
            Err(e) => {
                tracing::warn!(user_id = %identity.user_id, error = %e, "subscription check failed, using stored plan");
                let fallback = identity.known_plan.unwrap_or_default();
                state.value = SubscriptionStatus {
                    subscribed: fallback.is_pro(),
                    plan_type: fallback,
                    plan_expiry_date: None,
                    is_loading: false,
                    error: Some(e.to_string()),
                };
                None
            }
        };

        RefreshOutcome::Completed {
            status: state.value.clone(),
            customer_id,
        }
    }

    /// Refreshes only when nothing was fetched yet or the value went stale.
    pub async fn refresh_if_needed(&self) -> RefreshOutcome {
        match self.phase() {
            SubscriptionPhase::Unknown | SubscriptionPhase::Stale => self.refresh().await,
            SubscriptionPhase::Pending => RefreshOutcome::Skipped,
            SubscriptionPhase::Resolved => RefreshOutcome::NotNeeded,
        }
    }

    /// After a successful checkout the processor's webhook may lag, so wait
    /// a moment and check once more. Cancelled checkouts need nothing.
    pub async fn checkout_returned(&self, outcome: CheckoutOutcome) -> RefreshOutcome {
        match outcome {
            CheckoutOutcome::Success => {
                self.clock
                    .sleep(Duration::from_millis(CHECKOUT_REFRESH_DELAY_MS))
                    .await;
                self.refresh().await
            }
            CheckoutOutcome::Cancelled => RefreshOutcome::NotNeeded,
        }
    }
}

struct TrackedResolver {
    resolver: Arc<SubscriptionResolver>,
    last_accessed: OffsetDateTime,
}

/// One resolver per signed-in user, evicting the least recently used entry
/// once `max_entries` is reached.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    db: Db,
    backend: Arc<dyn BillingBackend>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    resolvers: Arc<RwLock<HashMap<String, TrackedResolver>>>,
}

impl SubscriptionRegistry {
    pub fn new(db: Db, backend: Arc<dyn BillingBackend>, clock: Arc<dyn Clock>) -> Self {
        Self::with_max_entries(db, backend, clock, MAX_TRACKED_SUBSCRIPTIONS)
    }

    pub fn with_max_entries(
        db: Db,
        backend: Arc<dyn BillingBackend>,
        clock: Arc<dyn Clock>,
        max_entries: usize,
    ) -> Self {
        Self {
            db,
            backend,
            clock,
            max_entries,
            resolvers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolver for `identity`, created on first use.
    pub async fn resolver_for(&self, identity: &BillingIdentity) -> Arc<SubscriptionResolver> {
        let now = self.clock.now();
        let mut resolvers = self.resolvers.write().await;

        if let Some(entry) = resolvers.get_mut(&identity.user_id) {
            entry.last_accessed = now;
            entry.resolver.switch_identity(Some(identity.clone()));
            return entry.resolver.clone();
        }

        if resolvers.len() >= self.max_entries {
            Self::evict_lru(&mut resolvers);
        }

        let resolver = Arc::new(SubscriptionResolver::new(
            self.backend.clone(),
            self.clock.clone(),
        ));
        resolver.switch_identity(Some(identity.clone()));
        resolvers.insert(
            identity.user_id.clone(),
            TrackedResolver {
                resolver: resolver.clone(),
                last_accessed: now,
            },
        );
        resolver
    }

    fn evict_lru(resolvers: &mut HashMap<String, TrackedResolver>) {
        if let Some(oldest_key) = resolvers
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone())
        {
            if let Some(entry) = resolvers.remove(&oldest_key) {
                entry.resolver.switch_identity(None);
            }
        }
    }

    pub async fn tracked_count(&self) -> usize {
        self.resolvers.read().await.len()
    }

    /// Current status, refreshing first when unknown or stale.
    pub async fn status_for(&self, identity: &BillingIdentity) -> SubscriptionStatus {
        let resolver = self.resolver_for(identity).await;
        let outcome = resolver.refresh_if_needed().await;
        self.persist(&identity.user_id, &outcome).await;
        resolver.status()
    }

    /// Plan for gating. While another check is still running for a user that
    /// was never resolved, the plan stored on the user row is used.
    pub async fn plan_for(&self, identity: &BillingIdentity) -> PlanType {
        let resolver = self.resolver_for(identity).await;
        let outcome = resolver.refresh_if_needed().await;
        self.persist(&identity.user_id, &outcome).await;

        match outcome {
            RefreshOutcome::Completed { status, .. } => status.plan_type,
            _ => resolver
                .resolved_plan()
                .unwrap_or_else(|| identity.known_plan.unwrap_or_default()),
        }
    }

    /// Forces a remote check (unless one is already running).
    pub async fn refresh_for(&self, identity: &BillingIdentity) -> SubscriptionStatus {
        let resolver = self.resolver_for(identity).await;
        let outcome = resolver.refresh().await;
        self.persist(&identity.user_id, &outcome).await;
        resolver.status()
    }

    /// Drops the user's cached state, e.g. on logout.
    pub async fn forget(&self, user_id: &str) {
        if let Some(entry) = self.resolvers.write().await.remove(user_id) {
            entry.resolver.switch_identity(None);
        }
    }

    /// Schedules the delayed post-checkout refresh in the background.
    pub async fn checkout_returned(
        &self,
        identity: &BillingIdentity,
        outcome: CheckoutOutcome,
    ) -> Option<JoinHandle<()>> {
        if outcome != CheckoutOutcome::Success {
            return None;
        }

        let resolver = self.resolver_for(identity).await;
        let registry = self.clone();
        let user_id = identity.user_id.clone();
        Some(tokio::spawn(async move {
            let outcome = resolver.checkout_returned(CheckoutOutcome::Success).await;
            registry.persist(&user_id, &outcome).await;
        }))
    }

    /// One polling pass over every tracked user. Entries idle for longer than
    /// the idle window are dropped first; users whose check is still running
    /// are skipped.
    pub async fn poll_all(&self) {
        let now = self.clock.now();
        let idle_after = time::Duration::seconds(SUBSCRIPTION_IDLE_SECONDS);

        let tracked: Vec<(String, Arc<SubscriptionResolver>)> = {
            let mut resolvers = self.resolvers.write().await;
            resolvers.retain(|user_id, entry| {
                let active = now - entry.last_accessed < idle_after;
                if !active {
                    tracing::debug!(user_id = %user_id, "dropping idle subscription entry");
                    entry.resolver.switch_identity(None);
                }
                active
            });
            resolvers
                .iter()
                .map(|(user_id, entry)| (user_id.clone(), entry.resolver.clone()))
                .collect()
        };

        for (user_id, resolver) in tracked {
            let outcome = resolver.refresh().await;
            self.persist(&user_id, &outcome).await;
        }
    }

    pub fn spawn_poller(&self, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.poll_all().await;
            }
        })
    }

    /// Writes a successfully resolved plan back to the user row.
    async fn persist(&self, user_id: &str, outcome: &RefreshOutcome) {
        let RefreshOutcome::Completed {
            status,
            customer_id,
        } = outcome
        else {
            return;
        };
        if status.error.is_some() {
            return;
        }

        let conn = self.db.write().await;
        let result = conn
            .execute(
                "UPDATE users SET plan_type = ?, plan_expiry_date = ?, stripe_customer_id = COALESCE(?, stripe_customer_id) WHERE id = ?",
                (
                    status.plan_type.as_str(),
                    status.plan_expiry_date.clone(),
                    customer_id.clone(),
                    user_id,
                ),
            )
            .await;

        if let Err(e) = result {
            tracing::warn!(user_id, error = %e, "failed to store resolved plan");
        }
    }
}

pub async fn get_subscription(
    State(app_state): State<AppState>,
    session: Session,
) -> Result<(StatusCode, Json<SubscriptionStatus>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    let status = app_state
        .subscriptions
        .status_for(&BillingIdentity::from(&user))
        .await;
    Ok((StatusCode::OK, Json(status)))
}

pub async fn refresh_subscription(
    State(app_state): State<AppState>,
    session: Session,
) -> Result<(StatusCode, Json<SubscriptionStatus>), (StatusCode, String)> {
    let user = current_account(&app_state, &session).await?;
    let status = app_state
        .subscriptions
        .refresh_for(&BillingIdentity::from(&user))
        .await;
    Ok((StatusCode::OK, Json(status)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{BillingError, CheckoutSession, SubscriptionInfo};
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;
    use tokio::sync::Notify;

    struct StubBilling {
        calls: AtomicUsize,
        plan: Mutex<Result<PlanType, String>>,
        gate: Option<Arc<Notify>>,
    }

    impl StubBilling {
        fn answering(plan: PlanType) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                plan: Mutex::new(Ok(plan)),
                gate: None,
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                plan: Mutex::new(Err(message.to_string())),
                gate: None,
            }
        }

        fn gated(plan: PlanType, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::answering(plan)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BillingBackend for StubBilling {
        async fn check_subscription(
            &self,
            _identity: &BillingIdentity,
        ) -> Result<SubscriptionInfo, BillingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let plan = self.plan.lock().unwrap().clone();
            match plan {
                Ok(plan) => Ok(SubscriptionInfo {
                    subscribed: plan.is_pro(),
                    plan_type: plan,
                    plan_expiry_date: plan.is_pro().then(|| "2024-02-01T00:00:00Z".to_string()),
                    customer_id: Some("cus_123".to_string()),
                }),
                Err(message) => Err(BillingError::Api {
                    status: 500,
                    message,
                }),
            }
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

    fn identity(user_id: &str, known_plan: Option<PlanType>) -> BillingIdentity {
        BillingIdentity {
            user_id: user_id.to_string(),
            email: format!("{}@example.com", user_id),
            full_name: None,
            known_plan,
            customer_id: None,
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(datetime!(2024-01-10 12:00 UTC)))
    }

    async fn registry(
        backend: Arc<StubBilling>,
        clock: Arc<ManualClock>,
        max_entries: usize,
    ) -> SubscriptionRegistry {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::database::init_db(&dir.path().to_string_lossy())
            .await
            .unwrap();
        std::mem::forget(dir);
        SubscriptionRegistry::with_max_entries(db, backend, clock, max_entries)
    }

    #[tokio::test]
    async fn refresh_resolves_plan_from_backend() {
        let backend = Arc::new(StubBilling::answering(PlanType::Pro));
        let resolver = SubscriptionResolver::new(backend.clone(), clock());

        assert!(resolver.switch_identity(Some(identity("u1", None))));
        assert_eq!(resolver.phase(), SubscriptionPhase::Unknown);
        assert!(resolver.status().is_loading);

        let outcome = resolver.refresh().await;
        assert!(matches!(outcome, RefreshOutcome::Completed { .. }));

        let status = resolver.status();
        assert!(status.subscribed);
        assert_eq!(status.plan_type, PlanType::Pro);
        assert_eq!(status.plan_expiry_date.as_deref(), Some("2024-02-01T00:00:00Z"));
        assert!(!status.is_loading);
        assert_eq!(resolver.phase(), SubscriptionPhase::Resolved);
    }

    #[tokio::test]
    async fn failure_falls_back_to_known_plan() {
        let backend = Arc::new(StubBilling::failing("processor down"));
        let resolver = SubscriptionResolver::new(backend, clock());
        resolver.switch_identity(Some(identity("u1", Some(PlanType::Pro))));

        resolver.refresh().await;
        let status = resolver.status();
        assert_eq!(status.plan_type, PlanType::Pro);
        assert!(status.subscribed);
        assert!(status.error.unwrap().contains("processor down"));
    }

    #[tokio::test]
    async fn failure_without_known_plan_is_free() {
        let backend = Arc::new(StubBilling::failing("boom"));
        let resolver = SubscriptionResolver::new(backend, clock());
        resolver.switch_identity(Some(identity("u1", None)));

        resolver.refresh().await;
        let status = resolver.status();
        assert_eq!(status.plan_type, PlanType::Free);
        assert!(!status.subscribed);
        assert!(status.error.is_some());
        assert_eq!(resolver.phase(), SubscriptionPhase::Resolved);
    }

    #[tokio::test]
    async fn overlapping_refresh_is_a_no_op() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(StubBilling::gated(PlanType::Pro, gate.clone()));
        let resolver = Arc::new(SubscriptionResolver::new(backend.clone(), clock()));
        resolver.switch_identity(Some(identity("u1", None)));

        let first = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.refresh().await })
        };
        while backend.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(resolver.phase(), SubscriptionPhase::Pending);

        assert_eq!(resolver.refresh().await, RefreshOutcome::Skipped);
        assert_eq!(backend.calls(), 1);

        gate.notify_one();
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Completed { .. }));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn logout_resets_synchronously_and_discards_late_result() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(StubBilling::gated(PlanType::Pro, gate.clone()));
        let resolver = Arc::new(SubscriptionResolver::new(backend.clone(), clock()));
        resolver.switch_identity(Some(identity("u1", None)));

        let pending = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.refresh().await })
        };
        while backend.calls() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!resolver.switch_identity(None));
        let status = resolver.status();
        assert_eq!(status.plan_type, PlanType::Free);
        assert!(!status.subscribed);
        assert!(!status.is_loading);
        assert_eq!(resolver.phase(), SubscriptionPhase::Unknown);

        gate.notify_one();
        assert_eq!(pending.await.unwrap(), RefreshOutcome::Discarded);
        assert_eq!(resolver.status().plan_type, PlanType::Free);
        assert_eq!(resolver.refresh().await, RefreshOutcome::NoIdentity);
    }

    #[tokio::test]
    async fn same_user_keeps_cached_value() {
        let backend = Arc::new(StubBilling::answering(PlanType::Pro));
        let resolver = SubscriptionResolver::new(backend.clone(), clock());
        resolver.switch_identity(Some(identity("u1", None)));
        resolver.refresh().await;

        assert!(!resolver.switch_identity(Some(identity("u1", Some(PlanType::Pro)))));
        assert_eq!(resolver.status().plan_type, PlanType::Pro);
        assert_eq!(resolver.identity().unwrap().known_plan, Some(PlanType::Pro));

        assert!(resolver.switch_identity(Some(identity("u2", None))));
        assert_eq!(resolver.status().plan_type, PlanType::Free);
    }

    #[tokio::test]
    async fn value_goes_stale_after_five_minutes() {
        let backend = Arc::new(StubBilling::answering(PlanType::Free));
        let clock = clock();
        let resolver = SubscriptionResolver::new(backend.clone(), clock.clone());
        resolver.switch_identity(Some(identity("u1", None)));

        resolver.refresh_if_needed().await;
        assert_eq!(backend.calls(), 1);

        clock.advance(Duration::from_secs(60));
        assert_eq!(resolver.refresh_if_needed().await, RefreshOutcome::NotNeeded);
        assert_eq!(backend.calls(), 1);

        clock.advance(Duration::from_secs(240));
        assert_eq!(resolver.phase(), SubscriptionPhase::Stale);
        resolver.refresh_if_needed().await;
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn successful_checkout_refreshes_after_delay() {
        let backend = Arc::new(StubBilling::answering(PlanType::Pro));
        let clock = clock();
        let resolver = SubscriptionResolver::new(backend.clone(), clock.clone());
        resolver.switch_identity(Some(identity("u1", None)));
        let before = clock.now();

        let outcome = resolver.checkout_returned(CheckoutOutcome::Success).await;
        assert!(matches!(outcome, RefreshOutcome::Completed { .. }));
        assert_eq!(backend.calls(), 1);
        assert_eq!(clock.now() - before, time::Duration::milliseconds(2_000));

        let outcome = resolver.checkout_returned(CheckoutOutcome::Cancelled).await;
        assert_eq!(outcome, RefreshOutcome::NotNeeded);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn poll_skips_user_with_check_in_flight() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(StubBilling::gated(PlanType::Pro, gate.clone()));
        let registry = registry(backend.clone(), clock(), 10).await;

        let resolver = registry.resolver_for(&identity("u1", None)).await;
        let pending = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.refresh().await })
        };
        while backend.calls() == 0 {
            tokio::task::yield_now().await;
        }

        registry.poll_all().await;
        assert_eq!(backend.calls(), 1);
        assert_eq!(resolver.phase(), SubscriptionPhase::Pending);

        gate.notify_one();
        assert!(matches!(
            pending.await.unwrap(),
            RefreshOutcome::Completed { .. }
        ));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn poll_refreshes_active_users() {
        let backend = Arc::new(StubBilling::answering(PlanType::Pro));
        let clock = clock();
        let registry = registry(backend.clone(), clock.clone(), 10).await;

        registry.resolver_for(&identity("u1", None)).await;
        registry.resolver_for(&identity("u2", None)).await;

        registry.poll_all().await;
        assert_eq!(backend.calls(), 2);
        assert_eq!(registry.tracked_count().await, 2);
    }

    #[tokio::test]
    async fn full_registry_evicts_least_recently_used() {
        let backend = Arc::new(StubBilling::answering(PlanType::Pro));
        let clock = clock();
        let registry = registry(backend.clone(), clock.clone(), 2).await;

        let oldest = registry.resolver_for(&identity("u1", None)).await;
        oldest.refresh().await;
        assert_eq!(oldest.status().plan_type, PlanType::Pro);

        clock.advance(Duration::from_secs(1));
        registry.resolver_for(&identity("u2", None)).await;
        clock.advance(Duration::from_secs(1));
        registry.resolver_for(&identity("u3", None)).await;

        assert_eq!(registry.tracked_count().await, 2);
        assert!(oldest.identity().is_none());
        assert_eq!(oldest.status().plan_type, PlanType::Free);
        assert!(!oldest.status().subscribed);

        registry.poll_all().await;
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn idle_users_are_dropped_instead_of_polled() {
        let backend = Arc::new(StubBilling::answering(PlanType::Pro));
        let clock = clock();
        let registry = registry(backend.clone(), clock.clone(), 10).await;

        let idle = registry.resolver_for(&identity("u1", None)).await;
        idle.refresh().await;
        assert_eq!(backend.calls(), 1);

        clock.advance(Duration::from_secs(60 * 24 * 60 * 60));
        registry.resolver_for(&identity("u2", None)).await;

        registry.poll_all().await;
        registry.poll_all().await;

        assert_eq!(registry.tracked_count().await, 1);
        assert!(idle.identity().is_none());
        // u2 on each pass, u1 never again
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn checkout_markers_parse() {
        assert_eq!(CheckoutOutcome::parse("success"), Some(CheckoutOutcome::Success));
        assert_eq!(
            CheckoutOutcome::parse("cancelled"),
            Some(CheckoutOutcome::Cancelled)
        );
        assert_eq!(CheckoutOutcome::parse("other"), None);
    }
}
