//! Channel → subscriber and user → channel indexes.

use std::collections::{HashMap, HashSet};

use {dashmap::DashMap, serde::Serialize, tracing::warn};

use {
    pulse_auth::ChannelClass,
    pulse_common::{SocketId, UserId, now_ms},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("channel {channel} is full ({limit} subscribers)")]
    ChannelFull { channel: String, limit: usize },
}

struct ChannelEntry {
    subscribers: HashSet<SocketId>,
    created_at: u64,
    last_activity: u64,
}

impl ChannelEntry {
    fn new(now: u64) -> Self {
        Self {
            subscribers: HashSet::new(),
            created_at: now,
            last_activity: now,
        }
    }
}

/// Introspection view of a single channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub subscriber_count: usize,
    pub created_at: String,
    pub last_activity: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelTop {
    pub name: String,
    pub subscribers: usize,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_channels: usize,
    pub total_subscriptions: usize,
    pub by_type: HashMap<String, usize>,
    pub top_channels: Vec<ChannelTop>,
}

/// Bidirectional subscription indexes.
///
/// Invariants maintained here:
/// - a channel key exists iff its subscriber set is non-empty;
/// - `s ∈ channels[c]` iff `c ∈ user_channels[owner(s)]` (the connection
///   manager guarantees one socket per user, so the user-keyed reverse index
///   is unambiguous).
///
/// Writers serialize per map key through the shard guards; readers take
/// snapshots and never block each other.
pub struct ChannelRegistry {
    channels: DashMap<String, ChannelEntry>,
    user_channels: DashMap<UserId, HashSet<String>>,
    max_channel_subscribers: Option<usize>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new(max_channel_subscribers: Option<usize>) -> Self {
        Self {
            channels: DashMap::new(),
            user_channels: DashMap::new(),
            max_channel_subscribers,
        }
    }

    /// Record a subscription. Idempotent: returns `Ok(false)` when the socket
    /// was already subscribed.
    pub fn subscribe(
        &self,
        socket_id: &str,
        user_id: UserId,
        channel: &str,
    ) -> Result<bool, RegistryError> {
        let now = now_ms();
        {
            let mut entry = self
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| ChannelEntry::new(now));
            if entry.subscribers.contains(socket_id) {
                entry.last_activity = now;
                return Ok(false);
            }
            if let Some(limit) = self.max_channel_subscribers
                && entry.subscribers.len() >= limit
            {
                let is_empty = entry.subscribers.is_empty();
                drop(entry);
                if is_empty {
                    self.channels
                        .remove_if(channel, |_, e| e.subscribers.is_empty());
                }
                return Err(RegistryError::ChannelFull {
                    channel: channel.to_string(),
                    limit,
                });
            }
            entry.subscribers.insert(socket_id.to_string());
            entry.last_activity = now;
        }
        self.user_channels
            .entry(user_id)
            .or_default()
            .insert(channel.to_string());
        Ok(true)
    }

    /// Remove a subscription from both indexes. Returns whether the socket
    /// was subscribed. Empty channels and empty user entries are deleted.
    pub fn unsubscribe(&self, socket_id: &str, user_id: UserId, channel: &str) -> bool {
        let removed = match self.channels.get_mut(channel) {
            Some(mut entry) => {
                let removed = entry.subscribers.remove(socket_id);
                if removed {
                    entry.last_activity = now_ms();
                }
                removed
            },
            None => false,
        };
        if !removed {
            return false;
        }
        self.channels
            .remove_if(channel, |_, e| e.subscribers.is_empty());
        if let Some(mut set) = self.user_channels.get_mut(&user_id) {
            set.remove(channel);
        }
        self.user_channels.remove_if(&user_id, |_, s| s.is_empty());
        true
    }

    /// Remove every subscription held by a departing socket.
    ///
    /// The socket's channel list is copied under its own lock first, then
    /// removed channel by channel, so no subscription is ever half-removed.
    /// Returns the channels the socket was removed from.
    pub fn unsubscribe_all(&self, socket_id: &str, user_id: UserId) -> Vec<String> {
        let channels: Vec<String> = self
            .user_channels
            .get(&user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut removed = Vec::with_capacity(channels.len());
        for channel in channels {
            if self.unsubscribe(socket_id, user_id, &channel) {
                removed.push(channel);
            }
        }
        removed
    }

    /// Snapshot of a channel's subscriber set; empty for unknown channels.
    #[must_use]
    pub fn subscribers(&self, channel: &str) -> Vec<SocketId> {
        self.channels
            .get(channel)
            .map(|entry| entry.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the channels a user is subscribed to.
    #[must_use]
    pub fn channels_of(&self, user_id: UserId) -> Vec<String> {
        self.user_channels
            .get(&user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn channel_info(&self, channel: &str) -> Option<ChannelInfo> {
        self.channels.get(channel).map(|entry| ChannelInfo {
            name: channel.to_string(),
            subscriber_count: entry.subscribers.len(),
            created_at: pulse_common::ms_to_iso(entry.created_at),
            last_activity: pulse_common::ms_to_iso(entry.last_activity),
        })
    }

    #[must_use]
    pub fn total_subscriptions(&self) -> usize {
        self.channels
            .iter()
            .map(|entry| entry.subscribers.len())
            .sum()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut sizes: Vec<ChannelTop> = Vec::new();
        let mut total_subscriptions = 0;

        for entry in self.channels.iter() {
            let count = entry.subscribers.len();
            total_subscriptions += count;
            let kind = ChannelClass::classify(entry.key())
                .map(|c| c.kind())
                .unwrap_or("other");
            *by_type.entry(kind.to_string()).or_default() += 1;
            sizes.push(ChannelTop {
                name: entry.key().clone(),
                subscribers: count,
            });
        }

        sizes.sort_by(|a, b| b.subscribers.cmp(&a.subscribers).then(a.name.cmp(&b.name)));
        sizes.truncate(10);

        RegistryStats {
            total_channels: self.channels.len(),
            total_subscriptions,
            by_type,
            top_channels: sizes,
        }
    }

    /// Drop every subscription (admin reset). Logs if the indexes disagreed.
    pub fn clear(&self) {
        let channels = self.channels.len();
        let users = self.user_channels.len();
        self.channels.clear();
        self.user_channels.clear();
        if channels > 0 || users > 0 {
            warn!(channels, users, "registry cleared with live subscriptions");
        }
    }
}
