//! RS256 signer and JWKS tests.

mod common;

use common::TEST_RSA_PEM;
use gafaelfawr::server::signing::{PemSigner, Signer};
use jsonwebtoken::jwk::JwkSet;

#[test]
fn pem_sign_and_verify() {
    let signer = PemSigner::from_pem(TEST_RSA_PEM.as_bytes(), None).expect("create signer");

    let claims =
        serde_json::json!({"sub": "user1", "aud": "client", "exp": 9999999999u64, "iat": 1u64});
    let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    let token = signer.sign(header, &claims).expect("sign");

    // Build JwkSet and decode using jsonwebtoken
    let jwks = signer.jwks();
    let jwk_set: JwkSet = serde_json::from_value(jwks).expect("jwk_set");
    let decoding = jsonwebtoken::DecodingKey::from_jwk(&jwk_set.keys[0]).expect("decoding key");
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
    validation.set_audience(&["client"]);
    let data =
        jsonwebtoken::decode::<serde_json::Value>(&token, &decoding, &validation).expect("decode");
    assert_eq!(data.claims.get("sub").expect("sub"), "user1");
}

#[test]
fn pinned_key_id_is_used_everywhere() {
    let signer =
        PemSigner::from_pem(TEST_RSA_PEM.as_bytes(), Some("deployment-key")).expect("signer");
    assert_eq!(signer.kid(), "deployment-key");

    let jwk_set: JwkSet = serde_json::from_value(signer.jwks()).expect("jwk_set");
    assert_eq!(
        jwk_set.keys[0].common.key_id.as_deref(),
        Some("deployment-key")
    );

    let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    let token = signer
        .sign(header, &serde_json::json!({"exp": 9999999999u64}))
        .expect("sign");
    let header = jsonwebtoken::decode_header(&token).expect("header");
    assert_eq!(header.kid.as_deref(), Some("deployment-key"));
}

#[test]
fn derived_key_id_is_stable() {
    let a = PemSigner::from_pem(TEST_RSA_PEM.as_bytes(), None).expect("signer");
    let b = PemSigner::from_pem(TEST_RSA_PEM.as_bytes(), None).expect("signer");
    assert_eq!(a.kid(), b.kid());
    // An empty configured key id falls back to the derived one.
    let c = PemSigner::from_pem(TEST_RSA_PEM.as_bytes(), Some("")).expect("signer");
    assert_eq!(a.kid(), c.kid());
}

#[test]
fn expired_tokens_fail_verification() {
    let signer = PemSigner::from_pem(TEST_RSA_PEM.as_bytes(), None).expect("signer");
    let now = chrono::Utc::now().timestamp();
    let claims =
        serde_json::json!({"sub": "user1", "aud": "client", "exp": now - 600, "iat": now - 1200});
    let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    let token = signer.sign(header, &claims).expect("sign");

    let jwk_set: JwkSet = serde_json::from_value(signer.jwks()).expect("jwk_set");
    let decoding = jsonwebtoken::DecodingKey::from_jwk(&jwk_set.keys[0]).expect("decoding key");
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
    validation.set_audience(&["client"]);
    let err = jsonwebtoken::decode::<serde_json::Value>(&token, &decoding, &validation)
        .expect_err("expired token must not verify");
    assert!(matches!(
        err.kind(),
        jsonwebtoken::errors::ErrorKind::ExpiredSignature
    ));
}
