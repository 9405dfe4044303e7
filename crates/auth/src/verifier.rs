//! Bearer credential verification.

use std::time::Duration;

use {
    serde::Deserialize,
    sha2::{Digest, Sha256},
    tracing::{debug, warn},
};

use pulse_common::{Role, UserIdentity};

use crate::{cache::IdentityCache, error::AuthError};

const CACHE_MAX_ENTRIES: usize = 10_000;
const UPSTREAM_MAX_ATTEMPTS: u32 = 3;
const UPSTREAM_BACKOFF_BASE: Duration = Duration::from_millis(250);

// ── Credential kinds ─────────────────────────────────────────────────────────

/// The two accepted credential shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// `<numeric-id>|<opaque>` — verified by the upstream application server.
    Opaque,
    /// Compact HMAC-signed token — verified locally.
    Signed,
}

impl CredentialKind {
    pub fn detect(token: &str) -> Result<Self, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        if let Some((id, rest)) = token.split_once('|') {
            if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && !rest.is_empty() {
                return Ok(Self::Opaque);
            }
            return Err(AuthError::Malformed("bad opaque token shape".into()));
        }
        if token.split('.').count() == 3 {
            return Ok(Self::Signed);
        }
        Err(AuthError::Malformed("unrecognized credential shape".into()))
    }
}

/// SHA-256 hex fingerprint of a credential. Cache keys and log fields use
/// this, never the raw token.
#[must_use]
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ── Verifier ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub upstream_api_url: String,
    pub upstream_api_key: String,
    pub jwt_secret: String,
    pub cache_ttl: Duration,
    pub upstream_timeout: Duration,
}

impl From<&pulse_config::Config> for VerifierConfig {
    fn from(cfg: &pulse_config::Config) -> Self {
        Self {
            upstream_api_url: cfg.upstream_api_url.clone(),
            upstream_api_key: cfg.upstream_api_key.clone(),
            jwt_secret: cfg.jwt_secret.clone(),
            cache_ttl: Duration::from_millis(cfg.auth_cache_ttl_ms),
            upstream_timeout: Duration::from_millis(cfg.upstream_timeout_ms),
        }
    }
}

/// Claims carried by the signed credential variant.
#[derive(Debug, Deserialize)]
struct SignedClaims {
    user_id: u64,
    #[serde(default)]
    role: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    avatar: Option<String>,
    exp: u64,
    #[allow(dead_code)]
    iat: u64,
}

/// Upstream verification response envelope.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    success: bool,
    #[serde(default)]
    data: Option<VerifyData>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    user: UpstreamUser,
}

#[derive(Debug, Deserialize)]
struct UpstreamUser {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    avatar: Option<String>,
}

/// Resolves presented credentials to verified identities.
pub struct CredentialVerifier {
    http: reqwest::Client,
    config: VerifierConfig,
    decoding_key: jsonwebtoken::DecodingKey,
    validation: jsonwebtoken::Validation,
    cache: IdentityCache,
}

impl CredentialVerifier {
    #[must_use]
    pub fn new(config: VerifierConfig) -> Self {
        let decoding_key = jsonwebtoken::DecodingKey::from_secret(config.jwt_secret.as_bytes());
        let validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        Self {
            http: reqwest::Client::new(),
            config,
            decoding_key,
            validation,
            cache: IdentityCache::new(CACHE_MAX_ENTRIES),
        }
    }

    /// Verify a credential and resolve the identity, consulting the cache
    /// first. The cache never extends the credential's own lifetime.
    pub async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        let token = token.trim();
        let kind = CredentialKind::detect(token)?;
        let fp = fingerprint(token);

        if let Some(identity) = self.cache.get(&fp) {
            debug!(fingerprint = %&fp[..12], "credential cache hit");
            return Ok(identity);
        }

        let (identity, ttl) = match kind {
            CredentialKind::Signed => self.verify_signed(token)?,
            CredentialKind::Opaque => self.verify_opaque(token).await?,
        };
        self.cache.insert(fp, identity.clone(), ttl);
        Ok(identity)
    }

    /// Drop all cached identities (admin flush).
    pub fn flush_cache(&self) {
        self.cache.flush();
    }

    fn verify_signed(&self, token: &str) -> Result<(UserIdentity, Duration), AuthError> {
        let data = jsonwebtoken::decode::<SignedClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    AuthError::RejectedByUpstream("invalid signature".into())
                },
                other => AuthError::Malformed(format!("{other:?}")),
            })?;
        let claims = data.claims;

        let now_secs = pulse_common::now_ms() / 1_000;
        let remaining = Duration::from_secs(claims.exp.saturating_sub(now_secs));
        let ttl = self.config.cache_ttl.min(remaining);

        let identity = UserIdentity {
            user_id: claims.user_id,
            role: Role::parse(&claims.role),
            permissions: claims.permissions.into_iter().collect(),
            name: claims.name,
            email: claims.email,
            avatar: claims.avatar,
        };
        Ok((identity, ttl))
    }

    async fn verify_opaque(&self, token: &str) -> Result<(UserIdentity, Duration), AuthError> {
        let url = format!("{}/api/websocket-api/verify-user", self.config.upstream_api_url);
        let mut last_failure = String::new();

        for attempt in 0..UPSTREAM_MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(UPSTREAM_BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }

            let response = self
                .http
                .post(&url)
                .timeout(self.config.upstream_timeout)
                .bearer_auth(token)
                .header("X-WebSocket-API-Key", &self.config.upstream_api_key)
                .json(&serde_json::json!({}))
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, error = %e, "upstream verification transport failure");
                    last_failure = e.to_string();
                    continue;
                },
            };

            let status = response.status();
            if status.is_server_error() {
                warn!(attempt, status = %status, "upstream verification server error");
                last_failure = format!("upstream returned {status}");
                continue;
            }
            if status.is_client_error() {
                let body: VerifyResponse = response.json().await.unwrap_or(VerifyResponse {
                    success: false,
                    data: None,
                    message: None,
                });
                let message = body.message.unwrap_or_else(|| status.to_string());
                return Err(AuthError::RejectedByUpstream(message));
            }

            let body: VerifyResponse = response
                .json()
                .await
                .map_err(|e| AuthError::Malformed(format!("bad upstream response: {e}")))?;
            if !body.success {
                let message = body.message.unwrap_or_else(|| "verification refused".into());
                return Err(AuthError::RejectedByUpstream(message));
            }
            let user = body
                .data
                .ok_or_else(|| AuthError::Malformed("upstream response missing user".into()))?
                .user;

            let identity = UserIdentity {
                user_id: user.id,
                role: Role::parse(&user.role),
                permissions: user.permissions.into_iter().collect(),
                name: user.name,
                email: user.email,
                avatar: user.avatar,
            };
            return Ok((identity, self.config.cache_ttl));
        }

        Err(AuthError::UpstreamUnavailable(last_failure))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        serde::Serialize,
    };

    #[derive(Serialize)]
    struct TestClaims {
        user_id: u64,
        role: String,
        permissions: Vec<String>,
        name: String,
        email: String,
        iat: u64,
        exp: u64,
    }

    fn sign(claims: &TestClaims, secret: &str) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn verifier(upstream_url: &str) -> CredentialVerifier {
        CredentialVerifier::new(VerifierConfig {
            upstream_api_url: upstream_url.trim_end_matches('/').to_string(),
            upstream_api_key: "upstream-secret".into(),
            jwt_secret: "jwt-secret".into(),
            cache_ttl: Duration::from_secs(30),
            upstream_timeout: Duration::from_secs(2),
        })
    }

    fn claims(user_id: u64, exp_offset_secs: i64) -> TestClaims {
        let now = pulse_common::now_ms() / 1_000;
        TestClaims {
            user_id,
            role: "member".into(),
            permissions: vec!["websocket:broadcast".into()],
            name: "Ada".into(),
            email: "ada@example.com".into(),
            iat: now,
            exp: now.saturating_add_signed(exp_offset_secs),
        }
    }

    fn upstream_user_body(id: u64) -> String {
        serde_json::json!({
            "success": true,
            "data": { "user": {
                "id": id,
                "name": "Bo",
                "email": "bo@example.com",
                "role": "premium",
                "permissions": ["forum:post"]
            }}
        })
        .to_string()
    }

    #[test]
    fn kind_detection() {
        assert_eq!(CredentialKind::detect("123|abcdef").unwrap(), CredentialKind::Opaque);
        assert_eq!(CredentialKind::detect("aa.bb.cc").unwrap(), CredentialKind::Signed);
        assert!(matches!(CredentialKind::detect(""), Err(AuthError::Missing)));
        assert!(matches!(
            CredentialKind::detect("abc|def"),
            Err(AuthError::Malformed(_))
        ));
        assert!(matches!(
            CredentialKind::detect("123|"),
            Err(AuthError::Malformed(_))
        ));
        assert!(matches!(
            CredentialKind::detect("plain-token"),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn fingerprint_is_stable_and_opaque() {
        let fp = fingerprint("123|secret-token");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint("123|secret-token"));
        assert_ne!(fp, fingerprint("123|other-token"));
        assert!(!fp.contains("secret"));
    }

    #[tokio::test]
    async fn signed_token_verifies_locally() {
        let verifier = verifier("http://unused.invalid");
        let token = sign(&claims(42, 600), "jwt-secret");

        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.user_id, 42);
        assert_eq!(identity.role, Role::Member);
        assert!(identity.has_permission("websocket:broadcast"));
    }

    #[tokio::test]
    async fn expired_signed_token_fails() {
        let verifier = verifier("http://unused.invalid");
        let token = sign(&claims(42, -600), "jwt-secret");
        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::Expired)
        ));
    }

    #[tokio::test]
    async fn wrong_secret_fails() {
        let verifier = verifier("http://unused.invalid");
        let token = sign(&claims(42, 600), "other-secret");
        assert!(verifier.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn opaque_token_verifies_upstream() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/websocket-api/verify-user")
            .match_header("x-websocket-api-key", "upstream-secret")
            .match_header("authorization", "Bearer 7|opaque-value")
            .with_status(200)
            .with_body(upstream_user_body(7))
            .create_async()
            .await;

        let verifier = verifier(&server.url());
        let identity = verifier.verify("7|opaque-value").await.unwrap();
        assert_eq!(identity.user_id, 7);
        assert_eq!(identity.role, Role::Premium);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn opaque_verification_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/websocket-api/verify-user")
            .with_status(200)
            .with_body(upstream_user_body(7))
            .expect(1)
            .create_async()
            .await;

        let verifier = verifier(&server.url());
        verifier.verify("7|opaque-value").await.unwrap();
        verifier.verify("7|opaque-value").await.unwrap();
        mock.assert_async().await;

        // Flushing forgets the identity; a third verify would hit upstream
        // again (and fail, since the mock is exhausted).
        verifier.flush_cache();
    }

    #[tokio::test]
    async fn upstream_rejection_is_terminal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/websocket-api/verify-user")
            .with_status(401)
            .with_body(r#"{"success":false,"message":"token revoked"}"#)
            .expect(1)
            .create_async()
            .await;

        let verifier = verifier(&server.url());
        match verifier.verify("7|revoked").await {
            Err(AuthError::RejectedByUpstream(message)) => {
                assert_eq!(message, "token revoked");
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn persistent_upstream_failure_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/websocket-api/verify-user")
            .with_status(500)
            .expect(UPSTREAM_MAX_ATTEMPTS as usize)
            .create_async()
            .await;

        let verifier = verifier(&server.url());
        let err = verifier.verify("9|down").await.unwrap_err();
        assert!(err.is_retryable());
        mock.assert_async().await;
    }
}
