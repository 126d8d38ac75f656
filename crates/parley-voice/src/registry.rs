//! Process-wide mapping from guild to its live voice connection.
//!
//! Joins for the same guild are serialized by a per-guild async lock held by
//! the connector for the whole join; a newer ready connection replaces (and
//! destroys) the one it supersedes.

use crate::connection::Connection;
use crate::error::VoiceError;
use crate::lock;
use parley_types::GuildId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    connections: Mutex<HashMap<GuildId, Connection>>,
    join_locks: Mutex<HashMap<GuildId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live connection for `guild_id`, if any.
    pub fn get(&self, guild_id: &GuildId) -> Option<Connection> {
        lock(&self.inner.connections).get(guild_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers `connection` for its guild. The connection it replaces, if
    /// any, is destroyed.
    pub(crate) fn insert(&self, connection: Connection) {
        let previous =
            lock(&self.inner.connections).insert(connection.guild_id().clone(), connection);
        if let Some(previous) = previous {
            info!(
                guild_id = %previous.guild_id(),
                connection_id = previous.id(),
                "replacing existing voice connection"
            );
            // Already-destroyed connections are fine to skip.
            let _ = previous.destroy();
        }
    }

    /// Unregisters `connection` if it is still the guild's current one.
    pub(crate) fn remove(&self, connection: &Connection) -> bool {
        let removed = {
            let mut connections = lock(&self.inner.connections);
            match connections.get(connection.guild_id()) {
                Some(current) if current.id() == connection.id() => {
                    connections.remove(connection.guild_id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.prune_join_lock(connection.guild_id());
        }
        removed
    }

    /// Lock that serializes joins for `guild_id`.
    pub(crate) fn join_lock(&self, guild_id: &GuildId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.inner.join_locks)
            .entry(guild_id.clone())
            .or_default()
            .clone()
    }

    /// Drops the guild's join lock unless a join still holds it or the guild
    /// still has a connection.
    pub(crate) fn prune_join_lock(&self, guild_id: &GuildId) {
        if lock(&self.inner.connections).contains_key(guild_id) {
            return;
        }
        let mut locks = lock(&self.inner.join_locks);
        if locks
            .get(guild_id)
            .is_some_and(|join| Arc::strong_count(join) == 1)
        {
            locks.remove(guild_id);
        }
    }

    /// Guilds with a join lock currently tracked.
    pub fn join_lock_count(&self) -> usize {
        lock(&self.inner.join_locks).len()
    }

    /// Destroys the guild's connection. Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Propagates `VoiceError::ConnectionDestroyed` if another task destroyed
    /// it concurrently.
    pub fn disconnect(&self, guild_id: &GuildId) -> Result<bool, VoiceError> {
        match self.get(guild_id) {
            Some(connection) => connection.destroy().map(|()| true),
            None => Ok(false),
        }
    }
}

/// Looks up the live connection for `guild_id`.
pub fn get_voice_connection(registry: &ConnectionRegistry, guild_id: &GuildId) -> Option<Connection> {
    registry.get(guild_id)
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("active_guilds", &self.len())
            .finish()
    }
}
