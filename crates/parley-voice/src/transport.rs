//! Narrow interfaces to the voice transport.
//!
//! The transport owns signaling, RTP, encryption and jitter buffering. The
//! helpers in this crate only need to open a link for a channel, watch its
//! status, push frames into it and pull per-user opus packets out of it.

use crate::error::VoiceError;
use crate::lock;
use crate::player::TrackEngine;
use async_trait::async_trait;
use bytes::Bytes;
use parley_types::{ChannelId, ConnectionStatus, GuildId, UserId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

const FEED_CAPACITY: usize = 256;

/// One frame of audio handed to a link.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioFrame {
    /// Interleaved stereo PCM, 960 samples per channel.
    Pcm(Vec<i16>),
    /// A single opus packet.
    Opus(Bytes),
    /// Filler sent while a resource stalls.
    Silence,
}

impl AudioFrame {
    pub fn is_silence(&self) -> bool {
        matches!(self, Self::Silence)
    }
}

/// Opens voice links on behalf of a guild's gateway session.
#[async_trait]
pub trait VoiceAdapter: Send + Sync + 'static {
    /// Starts joining `channel_id`. The link reports progress through
    /// [`VoiceLink::status`]; it is not expected to be ready on return.
    async fn open(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> Result<Arc<dyn VoiceLink>, VoiceError>;
}

/// A joined (or joining) voice session.
pub trait VoiceLink: Send + Sync + 'static {
    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    /// Queues one frame for transmission. Frames sent before the link is ready
    /// are dropped by the transport.
    fn send_frame(&self, frame: &AudioFrame);

    fn packets(&self) -> Arc<dyn PacketSource>;

    /// Leaves the channel and releases transport state. Idempotent.
    fn close(&self);

    /// Transports that decode and mix audio themselves play subscribed
    /// players' resources through this instead of receiving frames.
    fn track_engine(&self) -> Option<Arc<dyn TrackEngine>> {
        None
    }
}

/// Per-user incoming audio.
pub trait PacketSource: Send + Sync + 'static {
    /// Returns a feed of opus packets spoken by `user_id`. The feed closes when
    /// the user leaves or the link is closed.
    fn subscribe(&self, user_id: &UserId) -> Result<mpsc::Receiver<Bytes>, VoiceError>;
}

/// Moves a pending status forward; closed links keep their status.
pub(crate) fn advance(current: &mut ConnectionStatus, next: ConnectionStatus) -> bool {
    if current.is_pending() {
        *current = next;
        true
    } else {
        false
    }
}

/// Per-user packet fan-out shared by transports.
#[derive(Default)]
pub(crate) struct UserFeeds {
    senders: Mutex<HashMap<UserId, Vec<mpsc::Sender<Bytes>>>>,
    closed: AtomicBool,
}

impl UserFeeds {
    /// Delivers `packet` to every feed of `user_id`. Returns how many feeds
    /// accepted it; full feeds drop the packet.
    pub(crate) fn push(&self, user_id: &UserId, packet: Bytes) -> usize {
        let mut senders = lock(&self.senders);
        let Some(feeds) = senders.get_mut(user_id) else {
            return 0;
        };
        feeds.retain(|tx| !tx.is_closed());
        feeds
            .iter()
            .filter(|tx| tx.try_send(packet.clone()).is_ok())
            .count()
    }

    /// Ends `user_id`'s feeds.
    pub(crate) fn remove_user(&self, user_id: &UserId) {
        lock(&self.senders).remove(user_id);
    }

    /// Ends every feed and refuses new ones.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.senders).clear();
    }
}

impl PacketSource for UserFeeds {
    fn subscribe(&self, user_id: &UserId) -> Result<mpsc::Receiver<Bytes>, VoiceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::Source("voice link is closed".to_string()));
        }
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        lock(&self.senders)
            .entry(user_id.clone())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

/// The fields of a voice channel the connector needs.
#[derive(Clone)]
pub struct VoiceChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub adapter: Arc<dyn VoiceAdapter>,
}

impl VoiceChannel {
    pub fn new(
        id: impl Into<ChannelId>,
        guild_id: impl Into<GuildId>,
        adapter: Arc<dyn VoiceAdapter>,
    ) -> Self {
        Self {
            id: id.into(),
            guild_id: guild_id.into(),
            adapter,
        }
    }
}

impl fmt::Debug for VoiceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceChannel")
            .field("id", &self.id)
            .field("guild_id", &self.guild_id)
            .finish_non_exhaustive()
    }
}
