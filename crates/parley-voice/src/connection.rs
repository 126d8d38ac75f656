//! Voice connections and player subscriptions.

use crate::error::VoiceError;
use crate::lock;
use crate::player::{FrameSink, Player, TrackEngine};
use crate::receiver::VoiceReceiver;
use crate::registry::ConnectionRegistry;
use crate::transport::{AudioFrame, VoiceLink};
use parley_types::{ChannelId, ConnectionStatus, GuildId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, info};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A voice session in one channel of one guild.
///
/// Cloning shares the session. After [`Connection::destroy`] every operation
/// fails with `VoiceError::ConnectionDestroyed`.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    guild_id: GuildId,
    channel_id: ChannelId,
    link: Arc<dyn VoiceLink>,
    destroyed: AtomicBool,
    subscription: Mutex<Option<PlayerSubscription>>,
    registry: Option<ConnectionRegistry>,
}

impl Connection {
    pub(crate) fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        link: Arc<dyn VoiceLink>,
        registry: Option<ConnectionRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                guild_id,
                channel_id,
                link,
                destroyed: AtomicBool::new(false),
                subscription: Mutex::new(None),
                registry,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.inner.guild_id
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.inner.channel_id
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.is_destroyed() {
            ConnectionStatus::Destroyed
        } else {
            *self.inner.link.status().borrow()
        }
    }

    /// Status updates reported by the transport.
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.link.status()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<(), VoiceError> {
        if self.is_destroyed() {
            return Err(VoiceError::ConnectionDestroyed(self.inner.guild_id.clone()));
        }
        Ok(())
    }

    /// Routes `player`'s audio into this connection. A connection plays one
    /// player at a time; an existing subscription is released first.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::ConnectionDestroyed` after `destroy`.
    pub fn subscribe(&self, player: &Player) -> Result<PlayerSubscription, VoiceError> {
        self.ensure_alive()?;
        let sink: Arc<dyn FrameSink> = Arc::new(LinkSink {
            connection: Arc::downgrade(&self.inner),
        });
        let subscription = PlayerSubscription {
            player: player.clone(),
            sink_id: player.add_sink(sink),
            released: Arc::new(AtomicBool::new(false)),
        };

        let previous = lock(&self.inner.subscription).replace(subscription.clone());
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
        debug!(
            guild_id = %self.inner.guild_id,
            player_id = player.id(),
            "player subscribed to connection"
        );
        Ok(subscription)
    }

    /// Incoming audio of this connection's participants.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::ConnectionDestroyed` after `destroy`.
    pub fn receiver(&self) -> Result<VoiceReceiver, VoiceError> {
        self.ensure_alive()?;
        Ok(VoiceReceiver::new(
            self.inner.guild_id.clone(),
            self.inner.link.packets(),
        ))
    }

    /// Leaves the channel, releases the current subscription and removes the
    /// connection from its registry.
    ///
    /// # Errors
    ///
    /// Returns `VoiceError::ConnectionDestroyed` if already destroyed.
    pub fn destroy(&self) -> Result<(), VoiceError> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Err(VoiceError::ConnectionDestroyed(self.inner.guild_id.clone()));
        }
        if let Some(subscription) = lock(&self.inner.subscription).take() {
            subscription.unsubscribe();
        }
        self.inner.link.close();
        if let Some(registry) = &self.inner.registry {
            registry.remove(self);
        }
        info!(
            guild_id = %self.inner.guild_id,
            channel_id = %self.inner.channel_id,
            connection_id = self.inner.id,
            "voice connection destroyed"
        );
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("guild_id", &self.inner.guild_id)
            .field("channel_id", &self.inner.channel_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Forwards player frames into a link without keeping the connection alive.
struct LinkSink {
    connection: Weak<ConnectionInner>,
}

impl FrameSink for LinkSink {
    fn is_ready(&self) -> bool {
        self.connection.upgrade().is_some_and(|inner| {
            !inner.destroyed.load(Ordering::SeqCst)
                && *inner.link.status().borrow() == ConnectionStatus::Ready
        })
    }

    fn send_frame(&self, frame: &AudioFrame) {
        if let Some(inner) = self.connection.upgrade() {
            if !inner.destroyed.load(Ordering::SeqCst) {
                inner.link.send_frame(frame);
            }
        }
    }

    fn track_engine(&self) -> Option<Arc<dyn TrackEngine>> {
        let inner = self.connection.upgrade()?;
        if inner.destroyed.load(Ordering::SeqCst) {
            return None;
        }
        inner.link.track_engine()
    }
}

/// Binding between a player and a connection.
#[derive(Debug, Clone)]
pub struct PlayerSubscription {
    player: Player,
    sink_id: u64,
    released: Arc<AtomicBool>,
}

impl PlayerSubscription {
    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }

    /// Detaches the player. Returns `false` if already released.
    pub fn unsubscribe(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.player.remove_sink(self.sink_id)
    }
}
