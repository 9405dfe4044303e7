//! Channel name classification and subscription authorization.
//!
//! `authorize` is a total pure function of (identity, channel name): no IO,
//! no hidden state, same answer for the same inputs.

use pulse_common::{Role, UserId, UserIdentity};

/// Recognized channel shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClass {
    /// `public.<suffix>` — any authenticated user.
    Public,
    /// `private-user.<N>` — only the user with that id.
    PrivateUser(UserId),
    /// `admin.<suffix>` — admins only.
    Admin,
    /// `moderator.<suffix>` — admins and moderators.
    Moderator,
    /// `forum.<N>` — any non-guest.
    Forum(u64),
    /// `thread.<N>` — any non-guest.
    Thread(u64),
    /// `system.<suffix>` — admins only.
    System,
}

impl ChannelClass {
    /// Classify a channel name. Unknown shapes, empty suffixes, and
    /// non-numeric ids where one is required all return `None`.
    #[must_use]
    pub fn classify(name: &str) -> Option<Self> {
        let (prefix, suffix) = name.split_once('.')?;
        if suffix.is_empty() {
            return None;
        }
        match prefix {
            "public" => Some(Self::Public),
            "private-user" => suffix.parse().ok().map(Self::PrivateUser),
            "admin" => Some(Self::Admin),
            "moderator" => Some(Self::Moderator),
            "forum" => suffix.parse().ok().map(Self::Forum),
            "thread" => suffix.parse().ok().map(Self::Thread),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Stable label used in registry stats.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::PrivateUser(_) => "private_user",
            Self::Admin => "admin",
            Self::Moderator => "moderator",
            Self::Forum(_) => "forum",
            Self::Thread(_) => "thread",
            Self::System => "system",
        }
    }
}

/// Decide whether `identity` may subscribe to `channel`.
///
/// Exact ownership wins over role: an admin is not granted another user's
/// private channel. Unclassifiable names are denied.
#[must_use]
pub fn authorize(identity: &UserIdentity, channel: &str) -> bool {
    match ChannelClass::classify(channel) {
        None => false,
        Some(ChannelClass::Public) => true,
        Some(ChannelClass::PrivateUser(owner)) => identity.user_id == owner,
        Some(ChannelClass::Admin | ChannelClass::System) => identity.role == Role::Admin,
        Some(ChannelClass::Moderator) => identity.role.is_staff(),
        Some(ChannelClass::Forum(_) | ChannelClass::Thread(_)) => identity.role != Role::Guest,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::collections::BTreeSet};

    fn user(user_id: u64, role: Role) -> UserIdentity {
        UserIdentity {
            user_id,
            role,
            permissions: BTreeSet::new(),
            name: String::new(),
            email: String::new(),
            avatar: None,
        }
    }

    #[test]
    fn classify_known_shapes() {
        assert_eq!(ChannelClass::classify("public.news"), Some(ChannelClass::Public));
        assert_eq!(
            ChannelClass::classify("private-user.42"),
            Some(ChannelClass::PrivateUser(42))
        );
        assert_eq!(ChannelClass::classify("admin.system"), Some(ChannelClass::Admin));
        assert_eq!(
            ChannelClass::classify("moderator.reports"),
            Some(ChannelClass::Moderator)
        );
        assert_eq!(ChannelClass::classify("forum.7"), Some(ChannelClass::Forum(7)));
        assert_eq!(ChannelClass::classify("thread.99"), Some(ChannelClass::Thread(99)));
        assert_eq!(ChannelClass::classify("system.maintenance"), Some(ChannelClass::System));
    }

    #[test]
    fn classify_rejects_malformed() {
        assert_eq!(ChannelClass::classify(""), None);
        assert_eq!(ChannelClass::classify("public"), None);
        assert_eq!(ChannelClass::classify("public."), None);
        assert_eq!(ChannelClass::classify("private-user.alice"), None);
        assert_eq!(ChannelClass::classify("forum.x"), None);
        assert_eq!(ChannelClass::classify("chatroom.1"), None);
    }

    #[test]
    fn public_allows_any_role() {
        for role in [Role::Admin, Role::Member, Role::Guest] {
            assert!(authorize(&user(1, role), "public.news"));
        }
    }

    #[test]
    fn private_user_is_exact_ownership() {
        assert!(authorize(&user(42, Role::Member), "private-user.42"));
        assert!(!authorize(&user(7, Role::Member), "private-user.8"));
        // Ownership beats role: admins do not see other users' channels.
        assert!(!authorize(&user(1, Role::Admin), "private-user.999"));
    }

    #[test]
    fn admin_channels_are_admin_only() {
        assert!(authorize(&user(1, Role::Admin), "admin.system"));
        assert!(!authorize(&user(1, Role::Moderator), "admin.system"));
        assert!(authorize(&user(1, Role::Admin), "system.maintenance"));
        assert!(!authorize(&user(1, Role::Moderator), "system.maintenance"));
    }

    #[test]
    fn moderator_channels_include_admins() {
        assert!(authorize(&user(1, Role::Admin), "moderator.reports"));
        assert!(authorize(&user(1, Role::Moderator), "moderator.reports"));
        assert!(!authorize(&user(1, Role::Senior), "moderator.reports"));
    }

    #[test]
    fn forum_and_thread_exclude_guests() {
        for role in [Role::Admin, Role::Moderator, Role::Senior, Role::Member] {
            assert!(authorize(&user(1, role), "forum.12"));
            assert!(authorize(&user(1, role), "thread.3"));
        }
        assert!(!authorize(&user(1, Role::Guest), "forum.12"));
        assert!(!authorize(&user(1, Role::Guest), "thread.3"));
    }

    #[test]
    fn unknown_patterns_deny() {
        assert!(!authorize(&user(1, Role::Admin), ""));
        assert!(!authorize(&user(1, Role::Admin), "somechannel"));
        assert!(!authorize(&user(1, Role::Admin), "wildcard.*extra.parts"));
    }

    #[test]
    fn wildcard_suffixes_are_just_suffixes() {
        // Dots inside the suffix are part of the suffix, not structure.
        assert_eq!(
            ChannelClass::classify("public.alerts.critical"),
            Some(ChannelClass::Public)
        );
        assert_eq!(ChannelClass::classify("private-user.42.extra"), None);
    }

    #[test]
    fn repeated_calls_agree() {
        let identity = user(42, Role::Member);
        let first = authorize(&identity, "forum.8");
        for _ in 0..100 {
            assert_eq!(authorize(&identity, "forum.8"), first);
        }
    }
}
