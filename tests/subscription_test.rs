mod common;

use axum::http::StatusCode;
use common::*;
use saldus_server::models::PlanType;

#[tokio::test]
async fn status_is_cached_until_stale() -> anyhow::Result<()> {
    let test_app = setup_test_app().await?;
    let app = &test_app.router;
    let cookie = register_pro_user(&test_app, "cached@example.com").await?;

    let status = auth_request(app, "GET", "/subscription", &cookie, None).await?;
    assert_eq!(status.status, StatusCode::OK);
    let status = status.json();
    assert_eq!(status["subscribed"], true);
    assert_eq!(status["plan_type"], "pro");
    assert_eq!(status["plan_expiry_date"], "2024-02-15T12:00:00Z");
    assert_eq!(status["is_loading"], false);
    assert!(status["error"].is_null());
    assert_eq!(test_app.billing.calls(), 1);

    auth_request(app, "GET", "/subscription", &cookie, None).await?;
    auth_request(app, "GET", "/reports", &cookie, None).await?;
    assert_eq!(test_app.billing.calls(), 1);

    test_app
        .clock
        .advance(std::time::Duration::from_secs(5 * 60));
    auth_request(app, "GET", "/subscription", &cookie, None).await?;
    assert_eq!(test_app.billing.calls(), 2);

    let forced = auth_request(app, "POST", "/subscription/refresh", &cookie, None).await?;
    assert_eq!(forced.status, StatusCode::OK);
    assert_eq!(test_app.billing.calls(), 3);

    Ok(())
}

#[tokio::test]
async fn failure_falls_back_to_stored_plan() -> anyhow::Result<()> {
    let test_app = setup_test_app().await?;
    let app = &test_app.router;
    let cookie = register_pro_user(&test_app, "fallback@example.com").await?;

    // first successful check stores pro on the user row
    let status = auth_request(app, "GET", "/subscription", &cookie, None)
        .await?
        .json();
    assert_eq!(status["plan_type"], "pro");

    test_app.billing.set_failing(true);
    let status = auth_request(app, "POST", "/subscription/refresh", &cookie, None)
        .await?
        .json();
    assert_eq!(status["plan_type"], "pro");
    assert_eq!(status["subscribed"], true);
    assert!(status["plan_expiry_date"].is_null());
    assert!(status["error"].as_str().unwrap().contains("processor unavailable"));

    // gating keeps working on the fallback plan
    let goals = auth_request(app, "GET", "/goals", &cookie, None).await?;
    assert_eq!(goals.status, StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn failure_without_history_is_free() -> anyhow::Result<()> {
    let test_app = setup_test_app().await?;
    let app = &test_app.router;
    test_app.billing.set_failing(true);
    let cookie = register_user(app, "newbie@example.com", "password123").await?;

    let status = auth_request(app, "GET", "/subscription", &cookie, None)
        .await?
        .json();
    assert_eq!(status["plan_type"], "free");
    assert_eq!(status["subscribed"], false);
    assert!(status["error"].is_string());

    Ok(())
}

#[tokio::test]
async fn logout_drops_cached_subscription() -> anyhow::Result<()> {
    let test_app = setup_test_app().await?;
    let app = &test_app.router;
    let cookie = register_pro_user(&test_app, "leaving@example.com").await?;

    auth_request(app, "GET", "/subscription", &cookie, None).await?;
    assert_eq!(test_app.state.subscriptions.tracked_count().await, 1);

    auth_request(app, "POST", "/auth/logout", &cookie, None).await?;
    assert_eq!(test_app.state.subscriptions.tracked_count().await, 0);

    // a downgrade while logged out is seen on the next login
    test_app.billing.set_plan("leaving@example.com", PlanType::Free);
    let cookie = login_user(app, "leaving@example.com", "password123").await?;
    let status = auth_request(app, "GET", "/subscription", &cookie, None)
        .await?
        .json();
    assert_eq!(status["plan_type"], "free");

    Ok(())
}

#[tokio::test]
async fn billing_endpoints_return_urls() -> anyhow::Result<()> {
    let test_app = setup_test_app().await?;
    let app = &test_app.router;
    let cookie = register_user(app, "buyer@example.com", "password123").await?;

    let portal = auth_request(app, "POST", "/billing/portal", &cookie, None).await?;
    assert_eq!(portal.status, StatusCode::CONFLICT);

    let checkout = auth_request(app, "POST", "/billing/checkout", &cookie, None).await?;
    assert_eq!(checkout.status, StatusCode::OK, "{}", checkout.body);
    assert!(
        checkout.json()["url"]
            .as_str()
            .unwrap()
            .starts_with("https://checkout.test/")
    );

    // checkout stored the customer, so the portal is available now
    let portal = auth_request(app, "POST", "/billing/portal", &cookie, None).await?;
    assert_eq!(portal.status, StatusCode::OK, "{}", portal.body);
    assert!(portal.json()["url"].as_str().unwrap().ends_with("/settings"));

    Ok(())
}

#[tokio::test]
async fn poller_lets_go_of_users_who_left() -> anyhow::Result<()> {
    let test_app = setup_test_app().await?;
    let app = &test_app.router;
    let cookie = register_pro_user(&test_app, "gone@example.com").await?;

    auth_request(app, "GET", "/subscription", &cookie, None).await?;
    assert_eq!(test_app.state.subscriptions.tracked_count().await, 1);
    assert_eq!(test_app.billing.calls(), 1);

    test_app
        .clock
        .advance(std::time::Duration::from_secs(60 * 24 * 60 * 60));
    for _ in 0..3 {
        test_app.state.subscriptions.poll_all().await;
    }
    assert_eq!(test_app.state.subscriptions.tracked_count().await, 0);
    assert_eq!(test_app.billing.calls(), 1);

    // coming back starts tracking again from the stored plan
    let status = auth_request(app, "GET", "/subscription", &cookie, None)
        .await?
        .json();
    assert_eq!(status["plan_type"], "pro");
    assert_eq!(test_app.billing.calls(), 2);
    assert_eq!(test_app.state.subscriptions.tracked_count().await, 1);

    Ok(())
}
