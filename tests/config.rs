//! Settings parsing and validation tests.

use gafaelfawr::config::{ConfigError, Settings};
use std::io::Write;
use std::path::PathBuf;

const BASE_SETTINGS: &str = r#"
realm: example.com
session_secret_file: /etc/gafaelfawr/session-secret
database_url: sqlite:///var/lib/gafaelfawr/gafaelfawr.sqlite
redis_url: redis://localhost:6379/0
after_logout_url: https://example.com/
proxies:
  - 10.0.0.0/8
initial_admins:
  - alice
known_scopes:
  user:token: Can create and modify user tokens
  admin:token: Can administer all tokens
  read:all: Read access to everything
group_mapping:
  read:all:
    - lsst-sqre-square
issuer:
  iss: https://example.com
  aud:
    default: https://example.com
    internal: https://example.com/api
  key_id: deployment-key
  key_file: /etc/gafaelfawr/signing-key.pem
github:
  client_id: some-client-id
  client_secret_file: /etc/gafaelfawr/github-secret
"#;

fn load_yaml(yaml: &str) -> Result<Settings, ConfigError> {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(yaml.as_bytes()).expect("write settings");
    Settings::load(Some(file.path().to_path_buf()))
}

#[test]
fn full_settings_parse() {
    let settings = load_yaml(BASE_SETTINGS).expect("settings load");
    assert_eq!(settings.realm, "example.com");
    assert_eq!(
        settings.database_path().expect("db path"),
        PathBuf::from("/var/lib/gafaelfawr/gafaelfawr.sqlite")
    );
    assert_eq!(
        settings.redis_url.as_deref(),
        Some("redis://localhost:6379/0")
    );
    assert_eq!(settings.token_lifetime_minutes, 60 * 24);
    assert_eq!(settings.provider_timeout_seconds, 10);
    assert_eq!(settings.issuer.exp_minutes, 15);
    assert_eq!(settings.proxy_nets().len(), 1);
    let github = settings.github.expect("github provider");
    assert_eq!(
        github.login_url,
        "https://github.com/login/oauth/authorize"
    );
    assert_eq!(github.api_url, "https://api.github.com");
}

#[test]
fn yaml_errors_carry_position() {
    let err = load_yaml("realm: [unclosed").expect_err("parse fails");
    assert!(err.to_string().contains("yaml error"));
}

#[test]
fn provider_xor_is_enforced() {
    let both = format!(
        "{}\noidc:\n  client_id: x\n  client_secret_file: /s\n  login_url: https://op/auth\n  token_url: https://op/token\n  redirect_url: https://example.com/oauth2/callback\n  issuer: https://op\n  audience: aud\n",
        BASE_SETTINGS
    );
    let err = load_yaml(&both).expect_err("both providers rejected");
    assert!(err.to_string().contains("mutually exclusive"));

    let neither: String = BASE_SETTINGS
        .lines()
        .take_while(|line| !line.starts_with("github:"))
        .collect::<Vec<_>>()
        .join("\n");
    let err = load_yaml(&neither).expect_err("no provider rejected");
    assert!(err.to_string().contains("no upstream provider"));
}

#[test]
fn group_mapping_must_use_known_scopes() {
    let bad = BASE_SETTINGS.replace("  read:all:\n", "  write:all:\n");
    let err = load_yaml(&bad).expect_err("unknown scope rejected");
    assert!(err.to_string().contains("unknown scope"));
}

#[test]
fn synthetic_scopes_are_required() {
    let bad = BASE_SETTINGS.replace("  user:token: Can create and modify user tokens\n", "");
    let err = load_yaml(&bad).expect_err("missing user:token rejected");
    assert!(err.to_string().contains("user:token"));
}

#[test]
fn proxies_must_be_cidrs() {
    let bad = BASE_SETTINGS.replace("  - 10.0.0.0/8", "  - not-a-network");
    let err = load_yaml(&bad).expect_err("bad CIDR rejected");
    assert!(err.to_string().contains("CIDR"));
}

#[test]
fn bootstrap_token_must_be_well_formed() {
    let bad = format!("{}\nbootstrap_token: not-a-token\n", BASE_SETTINGS);
    let err = load_yaml(&bad).expect_err("bad bootstrap token rejected");
    assert!(err.to_string().contains("bootstrap_token"));
}

#[test]
fn database_url_forms() {
    let plain = BASE_SETTINGS.replace(
        "database_url: sqlite:///var/lib/gafaelfawr/gafaelfawr.sqlite",
        "database_url: /var/lib/gafaelfawr/gafaelfawr.sqlite",
    );
    let settings = load_yaml(&plain).expect("plain path accepted");
    assert_eq!(
        settings.database_path().expect("db path"),
        PathBuf::from("/var/lib/gafaelfawr/gafaelfawr.sqlite")
    );

    let postgres = BASE_SETTINGS.replace(
        "database_url: sqlite:///var/lib/gafaelfawr/gafaelfawr.sqlite",
        "database_url: postgresql://gafaelfawr@db/gafaelfawr",
    );
    let err = load_yaml(&postgres).expect_err("unsupported scheme rejected");
    assert!(err.to_string().contains("unsupported database_url"));
}
