//! Authentication
//!
//! Validates signed bearer tokens and produces a per-request user context.
//! Public paths bypass authentication entirely. Access and refresh tokens
//! carry a `type` claim and are rejected when presented in the wrong role;
//! the refresh exchange issues a fresh pair without revoking the old one.

use crate::error::{AuthError, Result};
use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Authenticated user, valid for one request (or one WS connection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub username: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl UserContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// JWT claims carried by both token types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    pub exp: i64,
    pub iat: i64,
    #[serde(rename = "type")]
    pub token_type: String,
}

/// Access + refresh pair returned by login and refresh flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// Permissions granted per role.
pub fn permissions_for_role(role: &str) -> Vec<String> {
    let perms: &[&str] = match role.to_lowercase().as_str() {
        "admin" => &[
            "user:read",
            "user:write",
            "user:delete",
            "trading:read",
            "trading:write",
            "trading:execute",
            "strategy:read",
            "strategy:write",
            "strategy:execute",
            "data:read",
            "data:write",
            "system:read",
            "system:write",
            "system:admin",
        ],
        "trader" => &[
            "user:read",
            "user:write",
            "trading:read",
            "trading:write",
            "trading:execute",
            "strategy:read",
            "strategy:write",
            "strategy:execute",
            "data:read",
        ],
        "viewer" => &["user:read", "trading:read", "strategy:read", "data:read"],
        _ => &[],
    };
    perms.iter().map(|p| p.to_string()).collect()
}

/// Token validator and issuer.
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    access_ttl: Duration,
    refresh_ttl: Duration,
    public_exact: HashSet<String>,
    public_prefixes: Vec<String>,
}

impl Authenticator {
    pub fn new(secret: &str, algorithm: &str, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        let algorithm = algorithm.parse().unwrap_or(Algorithm::HS256);
        let public_exact: HashSet<String> = [
            "/",
            "/health",
            "/metrics",
            "/docs",
            "/api/v1/auth/login",
            "/api/v1/auth/register",
            "/api/v1/auth/refresh",
        ]
        .iter()
        .map(|p| p.to_string())
        .collect();

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            access_ttl,
            refresh_ttl,
            public_exact,
            public_prefixes: vec!["/static/".to_string()],
        }
    }

    /// Add a path to the public allowlist. A trailing `/` makes it a prefix.
    pub fn add_public_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        if path.ends_with('/') && path.len() > 1 {
            self.public_prefixes.push(path);
        } else {
            self.public_exact.insert(path);
        }
    }

    /// Exact membership or any prefix match.
    pub fn is_public(&self, path: &str) -> bool {
        self.public_exact.contains(path)
            || self.public_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Authenticate a request. Public paths yield no user context; all other
    /// paths require a valid access token.
    pub fn authenticate(&self, headers: &HeaderMap, path: &str) -> Result<Option<UserContext>> {
        if self.is_public(path) {
            return Ok(None);
        }
        let token = extract_bearer(headers)?;
        let context = self.verify_access(&token)?;
        Ok(Some(context))
    }

    /// Verify an access token and build its user context.
    pub fn verify_access(&self, token: &str) -> std::result::Result<UserContext, AuthError> {
        let claims = self.verify(token, "access")?;
        Ok(context_from_claims(&claims))
    }

    /// Exchange a refresh token for a fresh access + refresh pair.
    pub fn refresh(&self, refresh_token: &str) -> std::result::Result<TokenPair, AuthError> {
        let claims = self.verify(refresh_token, "refresh")?;
        let roles = claims_roles(&claims);
        self.issue_pair(&claims.user_id, &claims.username, &roles)
    }

    /// Issue an access + refresh pair for a user.
    pub fn issue_pair(
        &self,
        user_id: &str,
        username: &str,
        roles: &[String],
    ) -> std::result::Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access_token: self.issue(user_id, username, roles, "access", self.access_ttl)?,
            refresh_token: self.issue(user_id, username, roles, "refresh", self.refresh_ttl)?,
            token_type: "bearer".to_string(),
            expires_in: self.access_ttl.as_secs(),
        })
    }

    /// Issue a single access token.
    pub fn issue_access(
        &self,
        user_id: &str,
        username: &str,
        roles: &[String],
    ) -> std::result::Result<String, AuthError> {
        self.issue(user_id, username, roles, "access", self.access_ttl)
    }

    fn issue(
        &self,
        user_id: &str,
        username: &str,
        roles: &[String],
        token_type: &str,
        ttl: Duration,
    ) -> std::result::Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            role: None,
            roles: Some(roles.to_vec()),
            exp: now + ttl.as_secs() as i64,
            iat: now,
            token_type: token_type.to_string(),
        };
        encode(&jsonwebtoken::Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|_| AuthError::InvalidSignature)
    }

    fn verify(&self, token: &str, expected_type: &str) -> std::result::Result<Claims, AuthError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|err| {
            match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidSignature,
            }
        })?;
        if data.claims.token_type != expected_type {
            log::warn!(
                "token type mismatch, expected {} got {}",
                expected_type,
                data.claims.token_type
            );
            return Err(AuthError::WrongTokenType);
        }
        Ok(data.claims)
    }
}

fn claims_roles(claims: &Claims) -> Vec<String> {
    match (&claims.roles, &claims.role) {
        (Some(roles), _) if !roles.is_empty() => roles.clone(),
        (_, Some(role)) => vec![role.clone()],
        _ => Vec::new(),
    }
}

fn context_from_claims(claims: &Claims) -> UserContext {
    let roles = claims_roles(claims);
    let mut permissions: Vec<String> = roles
        .iter()
        .flat_map(|r| permissions_for_role(r))
        .collect();
    permissions.sort();
    permissions.dedup();
    UserContext {
        user_id: claims.user_id.clone(),
        username: claims.username.clone(),
        roles,
        permissions,
    }
}

fn extract_bearer(headers: &HeaderMap) -> std::result::Result<String, AuthError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?;
    let value = header.to_str().map_err(|_| AuthError::MalformedHeader)?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(AuthError::MalformedHeader),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> Authenticator {
        Authenticator::new(
            "test-secret-for-unit-tests",
            "HS256",
            Duration::from_secs(1800),
            Duration::from_secs(7 * 24 * 3600),
        )
    }

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn test_issue_then_authenticate_roundtrip() {
        let auth = authenticator();
        let token = auth
            .issue_access("u1", "alice", &["trader".to_string()])
            .unwrap();
        let context = auth
            .authenticate(&bearer_headers(&token), "/api/v1/orders")
            .unwrap()
            .unwrap();
        assert_eq!(context.user_id, "u1");
        assert_eq!(context.username, "alice");
        assert!(context.has_role("trader"));
        assert!(context.has_permission("trading:execute"));
        assert!(!context.has_permission("system:admin"));
    }

    #[test]
    fn test_public_paths_skip_auth() {
        let auth = authenticator();
        let headers = HeaderMap::new();
        assert!(auth.authenticate(&headers, "/health").unwrap().is_none());
        assert!(auth
            .authenticate(&headers, "/static/app.js")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_missing_and_malformed_tokens() {
        let auth = authenticator();
        let err = auth
            .authenticate(&HeaderMap::new(), "/api/v1/orders")
            .unwrap_err();
        assert_eq!(err.code(), "missing_token");

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcjpwYXNz".parse().unwrap(),
        );
        let err = auth.authenticate(&headers, "/api/v1/orders").unwrap_err();
        assert_eq!(err.code(), "malformed_header");
    }

    #[test]
    fn test_wrong_secret_is_invalid_signature() {
        let auth = authenticator();
        let other = Authenticator::new(
            "completely-different-secret",
            "HS256",
            Duration::from_secs(1800),
            Duration::from_secs(3600),
        );
        let token = other
            .issue_access("u1", "alice", &["viewer".to_string()])
            .unwrap();
        let err = auth
            .authenticate(&bearer_headers(&token), "/api/v1/orders")
            .unwrap_err();
        assert_eq!(err.code(), "invalid_signature");
    }

    #[test]
    fn test_refresh_token_rejected_as_access() {
        let auth = authenticator();
        let pair = auth
            .issue_pair("u1", "alice", &["trader".to_string()])
            .unwrap();
        let err = auth
            .authenticate(&bearer_headers(&pair.refresh_token), "/api/v1/orders")
            .unwrap_err();
        assert_eq!(err.code(), "wrong_token_type");
    }

    #[test]
    fn test_access_token_rejected_for_refresh() {
        let auth = authenticator();
        let pair = auth
            .issue_pair("u1", "alice", &["trader".to_string()])
            .unwrap();
        let err = auth.refresh(&pair.access_token).unwrap_err();
        assert_eq!(err.code(), "wrong_token_type");
    }

    #[test]
    fn test_refresh_issues_new_pair() {
        let auth = authenticator();
        let pair = auth
            .issue_pair("u1", "alice", &["admin".to_string()])
            .unwrap();
        let fresh = auth.refresh(&pair.refresh_token).unwrap();
        let context = auth.verify_access(&fresh.access_token).unwrap();
        assert_eq!(context.user_id, "u1");
        assert!(context.has_role("admin"));
        // Not revoked on use; still valid until expiry.
        assert!(auth.refresh(&pair.refresh_token).is_ok());
    }

    #[test]
    fn test_expired_token() {
        let auth = Authenticator::new(
            "test-secret-for-unit-tests",
            "HS256",
            Duration::from_secs(0),
            Duration::from_secs(0),
        );
        let token = auth
            .issue_access("u1", "alice", &["viewer".to_string()])
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let err = auth.verify_access(&token).unwrap_err();
        assert_eq!(err.code(), "expired");
    }

    #[test]
    fn test_single_role_claim() {
        let auth = authenticator();
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "u2".to_string(),
            user_id: "u2".to_string(),
            username: "bob".to_string(),
            role: Some("viewer".to_string()),
            roles: None,
            exp: now + 600,
            iat: now,
            token_type: "access".to_string(),
        };
        let token = encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret-for-unit-tests"),
        )
        .unwrap();
        let context = auth.verify_access(&token).unwrap();
        assert_eq!(context.roles, vec!["viewer".to_string()]);
        assert!(context.has_permission("data:read"));
    }
}
