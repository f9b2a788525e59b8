//! Token store lifecycle tests: creation, lookup, modification, cascade
//! revocation, expiry, and cross-layer audit.

mod common;

use std::collections::BTreeSet;

use chrono::{Duration as ChronoDuration, Utc};
use common::{TestOptions, build_state, create_session};
use gafaelfawr::server::persist::HistoryAction;
use gafaelfawr::token::store::{CreateToken, StoreError, TokenUpdate};
use gafaelfawr::token::{Token, TokenKind};

fn scope_set(scopes: &[&str]) -> BTreeSet<String> {
    scopes.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    let data = create_session(state, "alice", &["user:token", "read:all"]).await;
    let found = state
        .store
        .get(&data.token)
        .await
        .expect("get")
        .expect("token resolves");
    assert_eq!(found.username, "alice");
    assert_eq!(found.kind, TokenKind::Session);
    assert_eq!(found.scopes, scope_set(&["read:all", "user:token"]));
    // The warm cache carries the email from login.
    assert_eq!(found.email.as_deref(), Some("alice@example.com"));
}

#[tokio::test]
async fn wrong_secret_does_not_resolve() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    let data = create_session(state, "alice", &["user:token"]).await;
    // Same key, different secret.
    let other = Token::generate().encode();
    let other_secret = other.rsplit('.').next().expect("secret half");
    let forged = Token::parse(&format!("gt-{}.{}", data.token.key(), other_secret))
        .expect("forged token parses");
    assert!(
        state
            .store
            .get(&forged)
            .await
            .expect("get succeeds")
            .is_none()
    );
}

#[tokio::test]
async fn plaintext_secret_never_reaches_disk() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    let data = create_session(state, "alice", &["user:token"]).await;
    let wire = data.token.encode();
    let secret = wire.rsplit('.').next().expect("secret half");

    let db_path = server.dir.path().join("gafaelfawr.sqlite");
    let raw = std::fs::read(&db_path).expect("read database file");
    let raw = String::from_utf8_lossy(&raw);
    assert!(raw.contains(data.token.key()), "key is stored");
    assert!(!raw.contains(secret), "secret must never be stored");
}

#[tokio::test]
async fn get_reads_through_after_cache_eviction() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    let data = create_session(state, "alice", &["user:token"]).await;
    // Simulate a cache wipe (new worker, redis restart).
    state
        .store
        .modify(
            data.token.key(),
            TokenUpdate {
                scopes: Some(scope_set(&["user:token", "read:all"])),
                ..Default::default()
            },
            "alice",
            None,
        )
        .await
        .expect("modify evicts the cache");

    let found = state
        .store
        .get(&data.token)
        .await
        .expect("get")
        .expect("token resolves from SQL");
    assert_eq!(found.scopes, scope_set(&["read:all", "user:token"]));
    // Read-through records have no email; it lives only in the cache.
    assert_eq!(found.email, None);
}

#[tokio::test]
async fn duplicate_user_token_name_is_rejected() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    let request = CreateToken {
        username: "bob".to_string(),
        kind: TokenKind::User,
        scopes: scope_set(&["read:all"]),
        expires: None,
        token_name: Some("ci".to_string()),
        parent: None,
        email: None,
    };
    state
        .store
        .create(request.clone(), None, "bob", None)
        .await
        .expect("first token created");
    let err = state
        .store
        .create(request, None, "bob", None)
        .await
        .expect_err("second creation fails");
    assert!(matches!(err, StoreError::DuplicateTokenName));

    let tokens = state.store.list(Some("bob")).await.expect("list");
    assert_eq!(tokens.len(), 1);

    // A different owner may reuse the name.
    state
        .store
        .create(
            CreateToken {
                username: "carol".to_string(),
                kind: TokenKind::User,
                scopes: scope_set(&[]),
                expires: None,
                token_name: Some("ci".to_string()),
                parent: None,
                email: None,
            },
            None,
            "carol",
            None,
        )
        .await
        .expect("other owner may use the same name");
}

#[tokio::test]
async fn modify_writes_history_and_respects_kind() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    let data = create_session(state, "alice", &["user:token"]).await;
    let err = state
        .store
        .modify(
            data.token.key(),
            TokenUpdate {
                token_name: Some(Some("renamed".to_string())),
                ..Default::default()
            },
            "alice",
            None,
        )
        .await
        .expect_err("session tokens cannot be renamed");
    assert!(matches!(err, StoreError::Invalid(_)));

    let new_expires = Utc::now() + ChronoDuration::hours(1);
    let info = state
        .store
        .modify(
            data.token.key(),
            TokenUpdate {
                expires: Some(Some(new_expires)),
                ..Default::default()
            },
            "alice",
            Some("203.0.113.7"),
        )
        .await
        .expect("modify expires");
    assert_eq!(
        info.expires.map(|e| e.timestamp()),
        Some(new_expires.timestamp())
    );

    let history = state.store.history(data.token.key()).await.expect("history");
    let actions: Vec<HistoryAction> = history.iter().map(|entry| entry.action).collect();
    assert_eq!(actions, vec![HistoryAction::Create, HistoryAction::Edit]);
    let edit = &history[1];
    assert_eq!(edit.actor, "alice");
    assert_eq!(edit.ip.as_deref(), Some("203.0.113.7"));
    assert!(edit.before.is_some());
    assert!(edit.after.is_some());
}

#[tokio::test]
async fn revoke_cascades_to_descendants() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    let session = create_session(state, "alice", &["user:token", "read:all"]).await;
    let notebook = state
        .minter
        .notebook(&session)
        .await
        .expect("notebook minted");
    let internal = state
        .minter
        .internal(&notebook, "nublado", &scope_set(&["read:all"]))
        .await
        .expect("internal minted");

    assert!(
        state
            .store
            .revoke(session.token.key(), "admin", None)
            .await
            .expect("revoke")
    );

    for token in [&session.token, &notebook.token, &internal.token] {
        assert!(
            state.store.get(token).await.expect("get").is_none(),
            "descendant must be gone after cascade"
        );
    }
    for key in [
        session.token.key(),
        notebook.token.key(),
        internal.token.key(),
    ] {
        let history = state.store.history(key).await.expect("history");
        let last = history.last().expect("history entries");
        assert_eq!(last.action, HistoryAction::Revoke);
        assert_eq!(last.actor, "admin");
    }
}

#[tokio::test]
async fn child_scopes_must_be_subset() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    let session = create_session(state, "alice", &["user:token"]).await;
    let err = state
        .minter
        .internal(&session, "nublado", &scope_set(&["read:all"]))
        .await
        .expect_err("scopes beyond the parent are rejected");
    assert!(matches!(err, StoreError::ChildScopes));
}

#[tokio::test]
async fn sweep_removes_expired_tokens() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    let request = CreateToken {
        username: "alice".to_string(),
        kind: TokenKind::User,
        scopes: scope_set(&[]),
        expires: Some(Utc::now() - ChronoDuration::seconds(5)),
        token_name: Some("stale".to_string()),
        parent: None,
        email: None,
    };
    let data = state
        .store
        .create(request, None, "alice", None)
        .await
        .expect("expired token created");

    let swept = state.store.sweep_expired().await.expect("sweep");
    assert_eq!(swept, 1);
    let history = state.store.history(data.token.key()).await.expect("history");
    assert_eq!(
        history.last().expect("entries").action,
        HistoryAction::Expire
    );
    assert!(state.store.get(&data.token).await.expect("get").is_none());
}

#[tokio::test]
async fn audit_reports_expired_rows() {
    let server = build_state(TestOptions::default()).await;
    let state = &server.state;

    create_session(state, "alice", &["user:token"]).await;
    assert!(state.store.audit().await.expect("audit").is_empty());

    state
        .store
        .create(
            CreateToken {
                username: "alice".to_string(),
                kind: TokenKind::User,
                scopes: scope_set(&[]),
                expires: Some(Utc::now() - ChronoDuration::seconds(5)),
                token_name: Some("stale".to_string()),
                parent: None,
                email: None,
            },
            None,
            "alice",
            None,
        )
        .await
        .expect("expired token created");

    let findings = state.store.audit().await.expect("audit");
    assert_eq!(findings.len(), 1);
    assert!(findings[0].problem.contains("expired"));
}
