//! End-to-end flows through the router over the in-memory store.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use axum::http::{Method, Request, StatusCode};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, Validation, decode};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;
use yeelo_auth_api::config::ApiConfig;
use yeelo_auth_api::{AppState, router};
use yeelo_auth_core::auth::jwt::{DEFAULT_AUDIENCE, TokenService, TokenSettings};
use yeelo_auth_core::auth::keys::{Jwks, KeyManager};
use yeelo_auth_core::auth::password::hash_password;
use yeelo_auth_core::auth::refresh::{RefreshTokenIssuer, hash_token};
use yeelo_auth_core::models::auth::TokenClaims;
use yeelo_auth_core::store::AuthStore;
use yeelo_auth_core::store::memory::MemoryAuthStore;

const SIGNING_KEY: &str = include_str!("../../yeelo_auth_core/tests/fixtures/signing_key.pem");

struct TestApp {
    app: Router,
    store: Arc<MemoryAuthStore>,
    tokens: TokenService,
}

fn test_state() -> (AppState, Arc<MemoryAuthStore>) {
    let keys = Arc::new(KeyManager::from_private_pem(SIGNING_KEY, "test-kid").expect("test key"));
    let tokens = TokenService::new(keys, TokenSettings::default());
    let store = Arc::new(MemoryAuthStore::new());
    let config = ApiConfig {
        bcrypt_cost: 4,
        ..ApiConfig::default()
    };
    let state = AppState::new(store.clone(), tokens, RefreshTokenIssuer::default(), config);
    (state, store)
}

fn test_app() -> TestApp {
    let (state, store) = test_state();
    TestApp {
        tokens: state.tokens.clone(),
        app: router(state),
        store,
    }
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    bearer: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let req = match body {
        Some(json) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(req).await.expect("request");
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("read body");
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    call(app, Method::POST, uri, Some(body), None).await
}

async fn register(app: &Router, email: &str, password: &str) -> Value {
    let (status, body) = post(
        app,
        "/register",
        json!({"email": email, "password": password, "firstName": "A", "lastName": "X"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body
}

async fn login(app: &Router, email: &str, password: &str) -> (StatusCode, Value) {
    post(app, "/login", json!({"email": email, "password": password})).await
}

/// Seed a super-admin and return its access token.
async fn admin_token(t: &TestApp) -> String {
    let hash = hash_password("rootpass1", 4).unwrap();
    let id = t.store.seed_user("root@x.com", &hash, "admin").unwrap();
    t.store.set_super_admin(id, true).unwrap();
    let (status, body) = login(&t.app, "root@x.com", "rootpass1").await;
    assert_eq!(status, StatusCode::OK);
    body["accessToken"].as_str().unwrap().to_string()
}

fn str_field<'a>(body: &'a Value, field: &str) -> &'a str {
    body[field].as_str().unwrap_or_else(|| panic!("missing {field} in {body}"))
}

#[tokio::test]
async fn register_login_refresh_scenario() {
    let t = test_app();

    let (status, reg) = post(
        &t.app,
        "/register",
        json!({
            "email": "a@x.com",
            "password": "secret123",
            "firstName": "A",
            "lastName": "X",
            "role": "customer"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!str_field(&reg, "accessToken").is_empty());
    assert!(!str_field(&reg, "refreshToken").is_empty());
    assert_eq!(reg["user"]["role"], "customer");
    assert_eq!(reg["user"]["fullName"], "A X");
    assert!(reg["user"].get("passwordHash").is_none());

    let (status, body) = login(&t.app, "a@x.com", "wrongpass").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_credentials");

    let (status, logged_in) = login(&t.app, "a@x.com", "secret123").await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(logged_in["accessToken"], reg["accessToken"]);
    assert_ne!(logged_in["refreshToken"], reg["refreshToken"]);
    assert!(logged_in["user"]["lastLoginAt"].is_string());

    let refresh_body = json!({"refreshToken": logged_in["refreshToken"]});
    let (status, rotated) = post(&t.app, "/token/refresh", refresh_body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(rotated["refreshToken"], logged_in["refreshToken"]);
    assert!(!str_field(&rotated, "accessToken").is_empty());

    let (status, body) = post(&t.app, "/token/refresh", refresh_body).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_refresh_token");

    // The replacement is still good.
    let (status, _) = post(
        &t.app,
        "/token/refresh",
        json!({"refreshToken": rotated["refreshToken"]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_email_and_wrong_password_look_the_same() {
    let t = test_app();
    register(&t.app, "a@x.com", "secret123").await;

    let (s1, b1) = login(&t.app, "nobody@x.com", "secret123").await;
    let (s2, b2) = login(&t.app, "a@x.com", "wrongpass").await;
    assert_eq!(s1, StatusCode::UNAUTHORIZED);
    assert_eq!(s1, s2);
    assert_eq!(b1, b2);
}

#[tokio::test]
async fn login_is_case_insensitive_on_email() {
    let t = test_app();
    register(&t.app, "a@x.com", "secret123").await;
    let (status, _) = login(&t.app, "  A@X.COM ", "secret123").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn register_rejects_bad_input() {
    let t = test_app();
    register(&t.app, "a@x.com", "secret123").await;

    let cases = [
        json!({"password": "secret123", "firstName": "A", "lastName": "X"}),
        json!({"email": "b@x.com", "firstName": "A", "lastName": "X"}),
        json!({"email": "b@x.com", "password": "secret123", "lastName": "X"}),
        json!({"email": "b@x.com", "password": "short", "firstName": "A", "lastName": "X"}),
        json!({"email": "not-an-email", "password": "secret123", "firstName": "A", "lastName": "X"}),
        json!({"email": "b@x.com", "password": "secret123", "firstName": "A", "lastName": "X", "role": "admin"}),
    ];
    for case in cases {
        let (status, body) = post(&t.app, "/register", case.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{case}");
        assert_eq!(body["error"], "validation_error");
    }

    let (status, body) = post(
        &t.app,
        "/register",
        json!({"email": "A@x.com", "password": "secret123", "firstName": "A", "lastName": "X"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "duplicate_account");
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() {
    let t = test_app();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/login")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "validation_error");

    let (status, _) = post(&t.app, "/login", json!({"email": "a@x.com"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = post(&t.app, "/token/refresh", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = post(&t.app, "/validate", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn validate_accepts_live_tokens_only() {
    let t = test_app();
    let reg = register(&t.app, "a@x.com", "secret123").await;

    let (status, body) = post(&t.app, "/validate", json!({"token": reg["accessToken"]})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["user"]["email"], "a@x.com");

    let (status, body) = post(&t.app, "/validate", json!({"token": "not.a.jwt"})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_token");

    let id: Uuid = str_field(&reg["user"], "id").parse().unwrap();
    let user = t.store.find_user_by_id(id).await.unwrap().unwrap();
    let expired = t
        .tokens
        .issue_at(&user, Utc::now() - Duration::hours(25))
        .unwrap();
    let (status, body) = post(&t.app, "/validate", json!({"token": expired.token})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn deactivation_takes_effect_on_next_call() {
    let t = test_app();
    let admin = admin_token(&t).await;
    let reg = register(&t.app, "a@x.com", "secret123").await;
    let id = str_field(&reg["user"], "id");

    let (status, _) = call(
        &t.app,
        Method::POST,
        &format!("/admin/users/{id}/deactivate"),
        None,
        Some(&admin),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = post(&t.app, "/validate", json!({"token": reg["accessToken"]})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_token");

    let (status, body) = post(
        &t.app,
        "/token/refresh",
        json!({"refreshToken": reg["refreshToken"]}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_refresh_token");

    let (status, body) = login(&t.app, "a@x.com", "secret123").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "account_deactivated");

    // Wrong password on a deactivated account still reads as bad credentials.
    let (_, body) = login(&t.app, "a@x.com", "wrongpass").await;
    assert_eq!(body["error"], "invalid_credentials");
}

#[tokio::test]
async fn admin_routes_require_super_admin() {
    let t = test_app();
    let reg = register(&t.app, "a@x.com", "secret123").await;
    let user_token = str_field(&reg, "accessToken");
    let id = str_field(&reg["user"], "id");
    let uri = format!("/admin/users/{id}/deactivate");

    let (status, body) = call(&t.app, Method::POST, &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_token");

    let (status, body) = call(&t.app, Method::POST, &uri, None, Some(user_token)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");

    let admin = admin_token(&t).await;
    let missing = format!("/admin/users/{}/deactivate", Uuid::now_v7());
    let (status, body) = call(&t.app, Method::POST, &missing, None, Some(&admin)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn permission_changes_apply_without_reissue() {
    let t = test_app();
    let reg = register(&t.app, "a@x.com", "secret123").await;
    assert_eq!(reg["user"]["permissions"], json!([]));
    let token = reg["accessToken"].clone();
    let id: Uuid = str_field(&reg["user"], "id").parse().unwrap();

    t.store.grant_user_permission(id, "reports.view").unwrap();
    t.store
        .grant_role_permission("customer", "orders.create")
        .unwrap();

    let (status, body) = post(&t.app, "/validate", json!({"token": token})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["user"]["permissions"],
        json!(["orders.create", "reports.view"])
    );

    // Held through both the role and directly: reported once.
    t.store.grant_user_permission(id, "orders.create").unwrap();
    let (_, body) = login(&t.app, "a@x.com", "secret123").await;
    assert_eq!(
        body["user"]["permissions"],
        json!(["orders.create", "reports.view"])
    );
}

#[tokio::test]
async fn refresh_rejects_expired_and_unknown_tokens() {
    let t = test_app();
    let reg = register(&t.app, "a@x.com", "secret123").await;
    let refresh = str_field(&reg, "refreshToken");
    t.store
        .set_refresh_token_expiry(&hash_token(refresh), Utc::now() - Duration::seconds(1))
        .unwrap();

    for token in [refresh, "never-issued"] {
        let (status, body) = post(&t.app, "/token/refresh", json!({"refreshToken": token})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_refresh_token");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refresh_has_one_winner() {
    let t = test_app();
    let reg = register(&t.app, "a@x.com", "secret123").await;
    let refresh = str_field(&reg, "refreshToken").to_string();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let app = t.app.clone();
        let refresh = refresh.clone();
        handles.push(tokio::spawn(async move {
            post(&app, "/token/refresh", json!({"refreshToken": refresh}))
                .await
                .0
        }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => ok += 1,
            status => assert_eq!(status, StatusCode::UNAUTHORIZED),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test]
async fn logout_revokes_refresh_token() {
    let t = test_app();
    let reg = register(&t.app, "a@x.com", "secret123").await;
    let body = json!({"refreshToken": reg["refreshToken"]});

    let (status, resp) = post(&t.app, "/logout", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["success"], true);

    let (status, _) = post(&t.app, "/token/refresh", body.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = post(&t.app, "/logout", body).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn me_returns_bearer_profile() {
    let t = test_app();
    let reg = register(&t.app, "a@x.com", "secret123").await;
    let token = str_field(&reg, "accessToken");

    let (status, body) = call(&t.app, Method::GET, "/me", None, Some(token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "a@x.com");
    assert_eq!(body["isActive"], true);

    let (status, _) = call(&t.app, Method::GET, "/me", None, Some("garbage")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sessions_record_client_context() {
    let t = test_app();
    let admin = admin_token(&t).await;

    let req = Request::builder()
        .method(Method::POST)
        .uri("/register")
        .header(CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
        .header(USER_AGENT, "yeelo-mobile/2.1")
        .body(Body::from(
            json!({"email": "a@x.com", "password": "secret123", "firstName": "A", "lastName": "X"})
                .to_string(),
        ))
        .unwrap();
    let resp = t.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let reg: Value = serde_json::from_slice(&bytes).unwrap();
    let id = str_field(&reg["user"], "id");

    let (status, body) = call(
        &t.app,
        Method::GET,
        &format!("/admin/users/{id}/sessions"),
        None,
        Some(&admin),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sessions = body["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["ipAddress"], "203.0.113.9");
    assert_eq!(sessions[0]["userAgent"], "yeelo-mobile/2.1");
    assert_eq!(
        sessions[0]["sessionTokenHash"],
        hash_token(str_field(&reg, "accessToken"))
    );
}

#[tokio::test]
async fn published_keys_verify_issued_tokens() {
    let t = test_app();
    let reg = register(&t.app, "a@x.com", "secret123").await;

    let (status, body) = call(&t.app, Method::GET, "/.well-known/jwks.json", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keys"][0]["kty"], "RSA");

    let set: Jwks = serde_json::from_value(body).unwrap();
    let key = set.find_by_kid("test-kid").unwrap().decoding_key().unwrap();
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[DEFAULT_AUDIENCE]);
    let data = decode::<TokenClaims>(str_field(&reg, "accessToken"), &key, &validation).unwrap();
    assert_eq!(data.claims.sub, str_field(&reg["user"], "id"));
    assert_eq!(data.claims.role, "customer");
}

#[tokio::test]
async fn health_needs_no_store() {
    let t = test_app();
    let (status, body) = call(&t.app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "auth-service");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn metrics_endpoint_depends_on_recorder() {
    let t = test_app();
    let (status, _) = call(&t.app, Method::GET, "/metrics", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (state, _) = test_state();
    let handle = PrometheusBuilder::new().build_recorder().handle();
    let app = router(state.with_metrics(handle));
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[test]
fn request_counter_is_labelled_by_route_template() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let app = test_app().app;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    metrics::with_local_recorder(&recorder, || {
        runtime.block_on(async {
            let (status, _) = post(&app, "/validate", json!({ "token": "garbage" })).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            let uri = format!("/admin/users/{}/deactivate", Uuid::now_v7());
            let (status, _) = call(&app, Method::POST, &uri, None, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        })
    });

    let rendered = handle.render();
    assert!(
        rendered.contains(
            r#"auth_http_requests_total{method="POST",path="/validate",status="401"} 1"#
        ),
        "{rendered}"
    );
    assert!(
        rendered.contains(
            r#"auth_http_requests_total{method="POST",path="/admin/users/{id}/deactivate",status="401"} 1"#
        ),
        "{rendered}"
    );
}

#[tokio::test]
async fn unknown_route_is_not_found_not_unauthorized() {
    let t = test_app();
    let (status, _) = call(&t.app, Method::GET, "/no/such/route", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = post(&t.app, "/valdiate", json!({ "token": "x" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
