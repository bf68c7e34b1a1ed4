use std::sync::Arc;

use auth_svc::config::AuthServiceConfig;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use userinfo_svc::config::UserInfoConfig;
use userinfo_svc::{build_router, AppState};

const ALICE_TOKEN: &str = "0123456789abcdef0123456789abcdef";

struct Fixture {
    dir: TempDir,
    router: Router,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("users.json"),
            json!({ "alice": { "name": "alice", "email": "alice@example.com", "age": "31" } })
                .to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("authtokens.json"),
            json!({ "alice": ALICE_TOKEN }).to_string(),
        )
        .unwrap();
        Self::with_dir(dir).await
    }

    async fn with_dir(dir: TempDir) -> Self {
        let state = AppState::open(&Self::config(&dir)).await.expect("state");
        Self {
            dir,
            router: build_router(Arc::new(state)),
        }
    }

    fn config(dir: &TempDir) -> UserInfoConfig {
        UserInfoConfig {
            users_path: dir.path().join("users.json"),
            tokens_path: dir.path().join("authtokens.json"),
            ..UserInfoConfig::default()
        }
    }

    fn users(&self) -> Value {
        let bytes = std::fs::read(self.dir.path().join("users.json")).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn details(&self, username: Option<&str>, token: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("GET").uri("/userdetails");
        if let Some(username) = username {
            builder = builder.header("username", username);
        }
        if let Some(token) = token {
            builder = builder.header("Authorization", token);
        }
        send(&self.router, builder.body(Body::empty()).unwrap()).await
    }

    async fn add(&self, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/useradd")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(&self.router, request).await
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).expect("json body"))
}

#[tokio::test]
async fn valid_session_returns_the_profile() {
    let fixture = Fixture::new().await;

    let (status, body) = fixture.details(Some("alice"), Some(ALICE_TOKEN)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "name": "alice", "email": "alice@example.com", "age": "31" })
    );
}

#[tokio::test]
async fn missing_headers_are_bad_requests() {
    let fixture = Fixture::new().await;

    for (username, token) in [
        (None, Some(ALICE_TOKEN)),
        (Some("alice"), None),
        (Some(""), Some(ALICE_TOKEN)),
        (None, None),
    ] {
        let (status, body) = fixture.details(username, token).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_request");
    }
}

#[tokio::test]
async fn wrong_token_is_unauthorized() {
    let fixture = Fixture::new().await;

    for (username, token) in [
        ("alice", "ffffffffffffffffffffffffffffffff"),
        ("bob", ALICE_TOKEN),
    ] {
        let (status, body) = fixture.details(Some(username), Some(token)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");
    }
}

#[tokio::test]
async fn valid_session_without_profile_is_not_found() {
    let fixture = Fixture::new().await;
    std::fs::write(
        fixture.dir.path().join("authtokens.json"),
        json!({ "alice": ALICE_TOKEN, "ghost": ALICE_TOKEN }).to_string(),
    )
    .unwrap();

    let (status, body) = fixture.details(Some("ghost"), Some(ALICE_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn corrupt_token_file_is_an_internal_error() {
    let fixture = Fixture::new().await;
    std::fs::write(fixture.dir.path().join("authtokens.json"), "{\"alice\":").unwrap();

    let (status, body) = fixture.details(Some("alice"), Some(ALICE_TOKEN)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "internal_error");
}

#[tokio::test]
async fn sign_up_then_conflict() {
    let fixture = Fixture::new().await;
    let carol = json!({ "name": "carol", "email": "carol@example.com", "age": "27" });

    let (status, body) = fixture.add(carol.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "message": "User added successfully" }));
    assert_eq!(fixture.users()["carol"], carol);

    let (status, body) = fixture
        .add(json!({ "name": "carol", "email": "other@example.com", "age": "99" }))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");
    assert_eq!(fixture.users()["carol"], carol);
}

#[tokio::test]
async fn sign_up_requires_every_field() {
    let fixture = Fixture::new().await;
    let before = fixture.users();

    for body in [
        json!({ "name": "dave", "email": "dave@example.com" }),
        json!({ "name": "", "email": "x@example.com", "age": "1" }),
        json!({ "name": "dave", "email": "", "age": "1" }),
        json!("dave"),
        json!(["dave", "dave@example.com", "40"]),
    ] {
        let (status, response) = fixture.add(body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response["error"]["code"], "invalid_request");
    }

    assert_eq!(fixture.users(), before);
}

#[tokio::test]
async fn data_files_are_created_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::with_dir(dir).await;

    assert_eq!(fixture.users(), json!({}));
    let tokens = std::fs::read_to_string(fixture.dir.path().join("authtokens.json")).unwrap();
    assert_eq!(serde_json::from_str::<Value>(&tokens).unwrap(), json!({}));
}

#[tokio::test]
async fn sign_up_login_and_profile_across_services() {
    let fixture = Fixture::with_dir(tempfile::tempdir().unwrap()).await;
    let erin = json!({ "name": "erin", "email": "erin@example.com", "age": "38" });
    assert_eq!(fixture.add(erin.clone()).await.0, StatusCode::OK);

    let auth_config = AuthServiceConfig {
        users_path: fixture.dir.path().join("users.json"),
        tokens_path: fixture.dir.path().join("authtokens.json"),
        ..AuthServiceConfig::default()
    };
    let auth = auth_svc::build_router(Arc::new(
        auth_svc::AppState::open(&auth_config).await.unwrap(),
    ));
    let login = |body: &'static str| {
        Request::builder()
            .method("POST")
            .uri("/auth")
            .body(Body::from(body))
            .unwrap()
    };

    let (status, first) = send(&auth, login(r#"{"username":"erin","password":"erin"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    let first_token = first["auth_token"].as_str().unwrap().to_string();

    let (status, profile) = fixture.details(Some("erin"), Some(first_token.as_str())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(profile, erin);

    let (_, second) = send(&auth, login(r#"{"username":"erin","password":"erin"}"#)).await;
    let second_token = second["auth_token"].as_str().unwrap();

    let (status, _) = fixture.details(Some("erin"), Some(first_token.as_str())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = fixture.details(Some("erin"), Some(second_token)).await;
    assert_eq!(status, StatusCode::OK);
}
