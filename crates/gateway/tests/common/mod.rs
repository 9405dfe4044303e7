//! Shared helpers for the gateway integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc};

use {
    pulse_config::Config,
    pulse_gateway::{AppState, build_router, state::GatewayState},
    serde::Serialize,
};

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const UPSTREAM_KEY: &str = "test-upstream-key";
pub const ADMIN_KEY: &str = "test-admin-key";

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<GatewayState>,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws(&self) -> String {
        format!("ws://{}/socket.io/?EIO=4&transport=websocket", self.addr)
    }
}

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.jwt_secret = JWT_SECRET.into();
    cfg.upstream_api_key = UPSTREAM_KEY.into();
    cfg.admin_key = Some(ADMIN_KEY.into());
    // Host memory pressure must not flip test servers to warning.
    cfg.thresholds.memory = pulse_config::WarnCritical {
        warn: 2.0,
        critical: 3.0,
    };
    cfg
}

pub async fn spawn(config: Config) -> TestServer {
    let state = GatewayState::new(config, None);
    let app_state = AppState::new(Arc::clone(&state));
    let router = build_router(app_state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    TestServer { addr, state }
}

pub async fn spawn_default() -> TestServer {
    spawn(test_config()).await
}

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

/// Mint a signed credential for tests.
pub fn sign_token(user_id: u64, role: &str, permissions: &[&str]) -> String {
    let now = pulse_common::now_ms() / 1_000;
    let claims = TestClaims {
        user_id,
        role: role.into(),
        permissions: permissions.iter().map(|p| (*p).to_string()).collect(),
        name: format!("user-{user_id}"),
        email: format!("user-{user_id}@example.com"),
        iat: now,
        exp: now + 600,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}
