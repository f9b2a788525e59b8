//! Token and admin API tests for `/auth/api/v1`.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{TestOptions, build_state, create_session};
use gafaelfawr::server::service::build_router;
use gafaelfawr::token::{Token, TokenKind};
use tower::ServiceExt;

fn request(method: &str, uri: &str, wire: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", wire));
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn user_token_create_is_unique_per_name() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;
    let router = build_router(state.clone());

    let session = create_session(state, "bob", &["user:token", "read:all"]).await;
    let wire = session.token.encode();
    let body = serde_json::json!({"token_name": "ci", "scopes": ["read:all"]});

    let response = router
        .clone()
        .oneshot(request("POST", "/auth/api/v1/tokens", &wire, Some(body.clone())))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let user_wire = created["token"].as_str().expect("wire token");
    Token::parse(user_wire).expect("created token parses");

    let response = router
        .clone()
        .oneshot(request("POST", "/auth/api/v1/tokens", &wire, Some(body)))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = router
        .oneshot(request("GET", "/auth/api/v1/tokens", &wire, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let listed = json_body(response).await;
    let named: Vec<_> = listed
        .as_array()
        .expect("array")
        .iter()
        .filter(|info| info["token_name"] == serde_json::json!("ci"))
        .collect();
    assert_eq!(named.len(), 1, "only one token named ci exists");
}

#[tokio::test]
async fn user_tokens_cannot_exceed_caller_scopes() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;
    let router = build_router(state.clone());

    let session = create_session(state, "bob", &["user:token"]).await;
    let response = router
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/tokens",
            &session.token.encode(),
            Some(serde_json::json!({"token_name": "ci", "scopes": ["read:all"]})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = router
        .oneshot(request(
            "POST",
            "/auth/api/v1/tokens",
            &session.token.encode(),
            Some(serde_json::json!({"token_name": "ci", "scopes": ["no:such"]})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn delete_cascades_and_records_history() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;
    let router = build_router(state.clone());

    let session = create_session(state, "alice", &["user:token", "read:all"]).await;
    let notebook = state.minter.notebook(&session).await.expect("notebook");
    let internal = state
        .minter
        .internal(
            &notebook,
            "nublado",
            &["read:all".to_string()].into_iter().collect(),
        )
        .await
        .expect("internal");

    let uri = format!("/auth/api/v1/tokens/{}", session.token.key());
    let response = router
        .clone()
        .oneshot(request("DELETE", &uri, &session.token.encode(), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Every member of the chain is now rejected by the decision engine.
    for token in [&session.token, &notebook.token, &internal.token] {
        let response = build_router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/auth?scope=read:all")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token.encode()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    for key in [
        session.token.key(),
        notebook.token.key(),
        internal.token.key(),
    ] {
        let history = state.store.history(key).await.expect("history");
        let last = history.last().expect("entries");
        assert_eq!(last.action.as_str(), "revoke");
        assert_eq!(last.actor, "alice");
    }
}

#[tokio::test]
async fn patch_modifies_and_rejects_duplicates() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;
    let router = build_router(state.clone());

    let session = create_session(state, "bob", &["user:token", "read:all"]).await;
    let wire = session.token.encode();

    for name in ["ci", "deploy"] {
        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/auth/api/v1/tokens",
                &wire,
                Some(serde_json::json!({"token_name": name, "scopes": []})),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    let listed = json_body(
        router
            .clone()
            .oneshot(request("GET", "/auth/api/v1/tokens", &wire, None))
            .await
            .expect("response"),
    )
    .await;
    let deploy_key = listed
        .as_array()
        .expect("array")
        .iter()
        .find(|info| info["token_name"] == serde_json::json!("deploy"))
        .and_then(|info| info["token"].as_str())
        .expect("deploy token key")
        .to_string();

    let uri = format!("/auth/api/v1/tokens/{}", deploy_key);
    let response = router
        .clone()
        .oneshot(request(
            "PATCH",
            &uri,
            &wire,
            Some(serde_json::json!({"scopes": ["read:all"]})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let patched = json_body(response).await;
    assert_eq!(patched["scopes"], serde_json::json!(["read:all"]));

    // Renaming over an existing name is a 422 on modify.
    let response = router
        .oneshot(request(
            "PATCH",
            &uri,
            &wire,
            Some(serde_json::json!({"token_name": "ci"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn ownership_is_enforced() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;
    let router = build_router(state.clone());

    let alice = create_session(state, "alice", &["user:token"]).await;
    let bob = create_session(state, "bob", &["user:token"]).await;

    let uri = format!("/auth/api/v1/tokens/{}", alice.token.key());
    let response = router
        .clone()
        .oneshot(request("GET", &uri, &bob.token.encode(), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Admins may read anyone's tokens.
    let admin = create_session(state, "root", &["admin:token"]).await;
    let response = router
        .oneshot(request("GET", &uri, &admin.token.encode(), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_routes_require_the_admin_scope() {
    let server = build_state(TestOptions {
        initial_admins: vec!["root".to_string()],
        ..Default::default()
    })
    .await;
    let state = &server.state;
    let router = build_router(state.clone());

    let user = create_session(state, "bob", &["user:token"]).await;
    let response = router
        .clone()
        .oneshot(request("GET", "/auth/api/v1/admins", &user.token.encode(), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let admin = create_session(state, "root", &["admin:token"]).await;
    let response = router
        .clone()
        .oneshot(request(
            "GET",
            "/auth/api/v1/admins",
            &admin.token.encode(),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let admins = json_body(response).await;
    assert_eq!(admins, serde_json::json!([{"username": "root"}]));

    let response = router
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/admins",
            &admin.token.encode(),
            Some(serde_json::json!({"username": "alice"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = router
        .oneshot(request(
            "DELETE",
            "/auth/api/v1/admins/alice",
            &admin.token.encode(),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn bootstrap_token_is_limited_to_token_and_admin_routes() {
    let bootstrap = Token::generate();
    let server = build_state(TestOptions {
        bootstrap_token: Some(bootstrap.encode()),
        ..Default::default()
    })
    .await;
    let state = &server.state;
    let router = build_router(state.clone());
    let wire = bootstrap.encode();

    // Token and admin routes accept it as a super-admin.
    let response = router
        .clone()
        .oneshot(request("GET", "/auth/api/v1/tokens", &wire, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/admins",
            &wire,
            Some(serde_json::json!({"username": "alice"})),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    // Identity routes reject it.
    let response = router
        .clone()
        .oneshot(request("GET", "/auth/api/v1/user-info", &wire, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // As is the decision engine: the bootstrap token is not a login.
    let response = router
        .oneshot(
            Request::builder()
                .uri("/auth?scope=read:all")
                .header(header::AUTHORIZATION, format!("Bearer {}", wire))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_may_create_service_tokens_for_others() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;
    let router = build_router(state.clone());

    let admin = create_session(state, "root", &["admin:token"]).await;
    let response = router
        .clone()
        .oneshot(request(
            "POST",
            "/auth/api/v1/tokens",
            &admin.token.encode(),
            Some(serde_json::json!({
                "username": "bot-mobu",
                "token_type": "service",
                "scopes": ["read:all"],
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let wire = created["token"].as_str().expect("wire");
    let token = Token::parse(wire).expect("parses");
    let data = state
        .store
        .get(&token)
        .await
        .expect("get")
        .expect("resolves");
    assert_eq!(data.kind, TokenKind::Service);
    assert_eq!(data.username, "bot-mobu");

    // Non-admins cannot.
    let user = create_session(state, "bob", &["user:token", "read:all"]).await;
    let response = router
        .oneshot(request(
            "POST",
            "/auth/api/v1/tokens",
            &user.token.encode(),
            Some(serde_json::json!({
                "username": "bot-mobu",
                "token_type": "service",
                "scopes": ["read:all"],
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn identity_routes_reflect_the_caller() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;
    let router = build_router(state.clone());

    let session = create_session(state, "alice", &["user:token", "read:all"]).await;
    let wire = session.token.encode();

    let response = router
        .clone()
        .oneshot(request("GET", "/auth/api/v1/user-info", &wire, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await;
    assert_eq!(info["username"], serde_json::json!("alice"));
    assert_eq!(info["email"], serde_json::json!("alice@example.com"));

    let response = router
        .oneshot(request("GET", "/auth/api/v1/token-info", &wire, None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await;
    assert_eq!(info["token"], serde_json::json!(session.token.key()));
    assert_eq!(info["token_type"], serde_json::json!("session"));
}
