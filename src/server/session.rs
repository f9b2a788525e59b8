//! Browser session cookie management.
//!
//! The `gafaelfawr` cookie carries an encrypted-and-authenticated blob with
//! up to three fields: the session token's wire form, the CSRF state of an
//! in-progress login, and the return URL to resume after login. A client
//! presenting a malformed, expired, or undecryptable cookie is simply
//! treated as unauthenticated; no hard error is ever surfaced for a bad
//! cookie.

use axum::http::{HeaderMap, header};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sealing::Sealer;
use crate::server::constants::SESSION_COOKIE_NAME;

/// Decrypted contents of the session cookie.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCookie {
    /// Wire form of the session token, present once authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// CSRF state of an in-progress login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Where to send the browser once login completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
}

impl SessionCookie {
    /// Seal this session into a cookie value.
    pub fn seal(&self, sealer: &Sealer) -> String {
        let payload = serde_json::to_vec(self).expect("session cookie serializes");
        sealer.seal(&payload)
    }

    /// Unseal a cookie value. Any failure (tampering, expiry, old format)
    /// yields `None` and the caller treats the browser as unauthenticated.
    pub fn unseal(sealer: &Sealer, value: &str, max_age: Duration) -> Option<Self> {
        let payload = sealer.unseal(value, max_age).ok()?;
        serde_json::from_slice(&payload).ok()
    }

    /// Extract and unseal the session cookie from request headers.
    pub fn from_headers(headers: &HeaderMap, sealer: &Sealer, max_age: Duration) -> Option<Self> {
        let cookie_str = headers.get(header::COOKIE)?.to_str().ok()?;
        let prefix = format!("{}=", SESSION_COOKIE_NAME);
        let value = cookie_str
            .split(';')
            .find_map(|pair| pair.trim().strip_prefix(prefix.as_str()))?;
        Self::unseal(sealer, value, max_age)
    }
}

/// `Set-Cookie` value establishing or refreshing the session cookie.
pub fn set_cookie_header(value: &str, max_age: Duration) -> String {
    format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; Secure; SameSite=Lax",
        SESSION_COOKIE_NAME,
        value,
        max_age.as_secs()
    )
}

/// `Set-Cookie` value deleting the session cookie.
pub fn clear_cookie_header() -> String {
    format!(
        "{}=deleted; Path=/; Max-Age=0; HttpOnly; Secure; SameSite=Lax",
        SESSION_COOKIE_NAME
    )
}

/// Generate the 128-bit CSRF state for a login redirect.
pub fn generate_state() -> String {
    let mut buf = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut buf)
        .expect("OsRng failed to produce random bytes");
    URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> Sealer {
        Sealer::from_base64(&Sealer::generate_key()).expect("sealer")
    }

    #[test]
    fn cookie_round_trip() {
        let sealer = sealer();
        let session = SessionCookie {
            token: Some("gt-abc.def".to_string()),
            state: None,
            return_url: Some("https://example.com/app".to_string()),
        };
        let value = session.seal(&sealer);
        let restored =
            SessionCookie::unseal(&sealer, &value, Duration::from_secs(60)).expect("unseal");
        assert_eq!(restored.token.as_deref(), Some("gt-abc.def"));
        assert_eq!(
            restored.return_url.as_deref(),
            Some("https://example.com/app")
        );
    }

    #[test]
    fn garbage_cookie_is_none() {
        let sealer = sealer();
        assert!(SessionCookie::unseal(&sealer, "not a cookie", Duration::from_secs(60)).is_none());
    }

    #[test]
    fn from_headers_finds_the_cookie() {
        let sealer = sealer();
        let session = SessionCookie {
            token: Some("gt-abc.def".to_string()),
            ..Default::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            format!("other=1; gafaelfawr={}; trailing=2", session.seal(&sealer))
                .parse()
                .expect("header value"),
        );
        let restored = SessionCookie::from_headers(&headers, &sealer, Duration::from_secs(60))
            .expect("session");
        assert_eq!(restored.token.as_deref(), Some("gt-abc.def"));
    }

    #[test]
    fn state_is_unique_and_urlsafe() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert_eq!(a.len(), 22);
    }
}
