//! Shared vocabulary for the pulse gateway: user identity, roles,
//! capability tokens, and time helpers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// ── Ids ──────────────────────────────────────────────────────────────────────

/// Numeric user id minted by the upstream application server.
pub type UserId = u64;

/// Opaque per-connection socket id (uuid v4, assigned by the gateway).
pub type SocketId = String;

// ── Capabilities ─────────────────────────────────────────────────────────────

/// Capability tokens recognized on the RPC surface.
pub mod capabilities {
    /// Allows calling the broadcast endpoints with a bearer credential.
    pub const BROADCAST: &str = "websocket:broadcast";
    /// Allows the connection-admin endpoints with a bearer credential.
    pub const ADMIN: &str = "websocket:admin";
}

// ── Roles ────────────────────────────────────────────────────────────────────

/// User role as assigned by the upstream application server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Moderator,
    Senior,
    Business,
    Premium,
    Member,
    Guest,
}

impl Role {
    /// Parse a role string, falling back to `Guest` for unknown values.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "admin" => Self::Admin,
            "moderator" => Self::Moderator,
            "senior" => Self::Senior,
            "business" => Self::Business,
            "premium" => Self::Premium,
            "member" => Self::Member,
            _ => Self::Guest,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Moderator => "moderator",
            Self::Senior => "senior",
            Self::Business => "business",
            Self::Premium => "premium",
            Self::Member => "member",
            Self::Guest => "guest",
        }
    }

    /// Moderation staff: admins and moderators.
    #[must_use]
    pub fn is_staff(&self) -> bool {
        matches!(self, Self::Admin | Self::Moderator)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Identity ─────────────────────────────────────────────────────────────────

/// A verified user identity, immutable for the lifetime of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub role: Role,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl UserIdentity {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }
}

// ── Socket summary ───────────────────────────────────────────────────────────

/// Minimal socket description exposed to admin endpoints and duplicate
/// rejections. The gateway owns the full record; everyone else sees this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketSummary {
    pub socket_id: SocketId,
    pub user_id: UserId,
    pub connected_at: String,
}

// ── Time helpers ─────────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current time as an ISO-8601 / RFC 3339 string (UTC, second precision).
#[must_use]
pub fn iso_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Convert epoch milliseconds to an ISO-8601 string; empty on overflow.
#[must_use]
pub fn ms_to_iso(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parse_round_trip() {
        for role in [
            Role::Admin,
            Role::Moderator,
            Role::Senior,
            Role::Business,
            Role::Premium,
            Role::Member,
            Role::Guest,
        ] {
            assert_eq!(Role::parse(role.as_str()), role);
        }
    }

    #[test]
    fn unknown_role_is_guest() {
        assert_eq!(Role::parse("superuser"), Role::Guest);
        assert_eq!(Role::parse(""), Role::Guest);
    }

    #[test]
    fn staff_roles() {
        assert!(Role::Admin.is_staff());
        assert!(Role::Moderator.is_staff());
        assert!(!Role::Member.is_staff());
        assert!(!Role::Guest.is_staff());
    }

    #[test]
    fn identity_serializes_role_lowercase() {
        let identity = UserIdentity {
            user_id: 42,
            role: Role::Moderator,
            permissions: BTreeSet::new(),
            name: "Ada".into(),
            email: "ada@example.com".into(),
            avatar: None,
        };
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["role"], "moderator");
        assert_eq!(json["user_id"], 42);
        assert!(json.get("avatar").is_none());
    }

    #[test]
    fn ms_to_iso_formats() {
        assert_eq!(ms_to_iso(0), "1970-01-01T00:00:00Z");
    }
}
