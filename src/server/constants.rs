// user agent used for outgoing HTTP(s) requests to upstream providers
pub const REQUEST_USER_AGENT: &str = "gafaelfawr/2";

// default bind address for the HTTP server
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";

// name of the browser session cookie
pub const SESSION_COOKIE_NAME: &str = "gafaelfawr";

// identity headers set on successful auth subrequests
pub const HEADER_AUTH_USER: &str = "X-Auth-Request-User";
pub const HEADER_AUTH_EMAIL: &str = "X-Auth-Request-Email";
pub const HEADER_AUTH_TOKEN: &str = "X-Auth-Request-Token";
pub const HEADER_AUTH_TOKEN_SCOPES: &str = "X-Auth-Request-Token-Scopes";
pub const HEADER_SCOPES_ACCEPTED: &str = "X-Auth-Request-Scopes-Accepted";
pub const HEADER_SCOPES_SATISFY: &str = "X-Auth-Request-Scopes-Satisfy";

// error hint headers consumed by the NGINX error-page rewrite
pub const HEADER_ERROR_STATUS: &str = "X-Error-Status";
pub const HEADER_ERROR_BODY: &str = "X-Error-Body";

// original-request metadata forwarded by NGINX
pub const HEADER_ORIGINAL_URI: &str = "X-Original-URI";
pub const HEADER_ORIGINAL_METHOD: &str = "X-Original-Method";
pub const HEADER_FORWARDED_FOR: &str = "X-Forwarded-For";

// username assigned to the bootstrap token
pub const BOOTSTRAP_USERNAME: &str = "<bootstrap>";
