//! In-memory voice transport.
//!
//! Links become ready after a configurable delay, record every frame sent to
//! them and let callers inject per-user opus packets. Used by the test suites
//! and by the host's smoke run.

use crate::error::VoiceError;
use crate::lock;
use crate::transport::{advance, AudioFrame, PacketSource, UserFeeds, VoiceAdapter, VoiceLink};
use async_trait::async_trait;
use bytes::Bytes;
use parley_types::{ChannelId, ConnectionStatus, GuildId, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum Readiness {
    After(Duration),
    Never,
    Refuse,
}

/// Adapter handing out [`LoopbackLink`]s.
#[derive(Clone)]
pub struct LoopbackAdapter {
    readiness: Readiness,
    links: Arc<Mutex<Vec<Arc<LoopbackLink>>>>,
}

impl LoopbackAdapter {
    /// Links report `Ready` after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self::with_readiness(Readiness::After(delay))
    }

    /// Links stay in `Signalling` forever.
    pub fn never_ready() -> Self {
        Self::with_readiness(Readiness::Never)
    }

    /// `open` fails outright.
    pub fn refusing() -> Self {
        Self::with_readiness(Readiness::Refuse)
    }

    fn with_readiness(readiness: Readiness) -> Self {
        Self {
            readiness,
            links: Arc::default(),
        }
    }

    /// Every link opened so far, oldest first.
    pub fn links(&self) -> Vec<Arc<LoopbackLink>> {
        lock(&self.links).clone()
    }

    pub fn last_link(&self) -> Option<Arc<LoopbackLink>> {
        lock(&self.links).last().cloned()
    }
}

impl Default for LoopbackAdapter {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

#[async_trait]
impl VoiceAdapter for LoopbackAdapter {
    async fn open(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> Result<Arc<dyn VoiceLink>, VoiceError> {
        let delay = match self.readiness {
            Readiness::Refuse => {
                return Err(VoiceError::Source(format!(
                    "loopback adapter refused channel {channel_id}"
                )))
            }
            Readiness::Never => None,
            Readiness::After(delay) => Some(delay),
        };

        let link = Arc::new(LoopbackLink::new(guild_id.clone(), channel_id.clone()));
        lock(&self.links).push(link.clone());

        if let Some(delay) = delay {
            let status = link.status.clone();
            tokio::spawn(async move {
                status.send_if_modified(|s| advance(s, ConnectionStatus::Connecting));
                tokio::time::sleep(delay).await;
                status.send_if_modified(|s| advance(s, ConnectionStatus::Ready));
            });
        }
        Ok(link)
    }
}

pub struct LoopbackLink {
    guild_id: GuildId,
    channel_id: ChannelId,
    status: Arc<watch::Sender<ConnectionStatus>>,
    frames: Mutex<Vec<AudioFrame>>,
    feeds: Arc<UserFeeds>,
    closed: AtomicBool,
}

impl LoopbackLink {
    pub fn new(guild_id: GuildId, channel_id: ChannelId) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Signalling);
        Self {
            guild_id,
            channel_id,
            status: Arc::new(status),
            frames: Mutex::new(Vec::new()),
            feeds: Arc::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Forces a status, e.g. to simulate a dropped link.
    pub fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    pub fn sent_frames(&self) -> Vec<AudioFrame> {
        lock(&self.frames).clone()
    }

    /// Non-silence frames received so far.
    pub fn audio_frame_count(&self) -> usize {
        lock(&self.frames).iter().filter(|f| !f.is_silence()).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Delivers `packet` to every subscriber of `user_id`. Returns how many
    /// feeds accepted it.
    pub fn speak(&self, user_id: &UserId, packet: Bytes) -> usize {
        self.feeds.push(user_id, packet)
    }

    /// Closes `user_id`'s feeds as if they left the channel.
    pub fn hang_up(&self, user_id: &UserId) {
        self.feeds.remove_user(user_id);
    }
}

impl VoiceLink for LoopbackLink {
    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    fn send_frame(&self, frame: &AudioFrame) {
        if self.is_closed() || *self.status.borrow() != ConnectionStatus::Ready {
            return;
        }
        lock(&self.frames).push(frame.clone());
    }

    fn packets(&self) -> Arc<dyn PacketSource> {
        self.feeds.clone()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.status.send_replace(ConnectionStatus::Destroyed);
        self.feeds.close();
        debug!(guild_id = %self.guild_id, channel_id = %self.channel_id, "loopback link closed");
    }
}

impl std::fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackLink")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("status", &*self.status.borrow())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn link_becomes_ready_after_delay() {
        let adapter = LoopbackAdapter::new(Duration::from_millis(5));
        let link = adapter.open(&"g".into(), &"c".into()).await.unwrap();
        let mut status = link.status();
        status
            .wait_for(|s| *s == ConnectionStatus::Ready)
            .await
            .unwrap();
        assert_eq!(adapter.links().len(), 1);
    }

    #[tokio::test]
    async fn frames_before_ready_are_dropped() {
        let link = LoopbackLink::new("g".into(), "c".into());
        link.send_frame(&AudioFrame::Silence);
        assert!(link.sent_frames().is_empty());
        link.set_status(ConnectionStatus::Ready);
        link.send_frame(&AudioFrame::Silence);
        assert_eq!(link.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn close_ends_feeds_and_refuses_new_ones() {
        let link = LoopbackLink::new("g".into(), "c".into());
        let user: UserId = "u".into();
        let mut feed = link.packets().subscribe(&user).unwrap();
        assert_eq!(link.speak(&user, Bytes::from_static(b"p")), 1);
        link.close();
        assert_eq!(feed.recv().await, Some(Bytes::from_static(b"p")));
        assert_eq!(feed.recv().await, None);
        assert!(link.packets().subscribe(&user).is_err());
        assert_eq!(*link.status().borrow(), ConnectionStatus::Destroyed);
    }
}
