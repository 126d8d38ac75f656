//! Per-user incoming audio.

use crate::error::VoiceError;
use crate::transport::PacketSource;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use parley_types::{GuildId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::debug;

/// Opus packets spoken by one participant.
pub type OpusStream = BoxStream<'static, Bytes>;

/// The 20 ms opus frame transports send while a participant is not talking.
pub const SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

pub fn is_silence_frame(packet: &[u8]) -> bool {
    packet == SILENCE_FRAME
}

/// When a per-user stream ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndBehavior {
    /// Only when the transport closes the feed.
    #[default]
    Manual,
    /// After the participant has been silent for the given duration. The
    /// timer starts with the first voice packet. Silence frames neither
    /// restart it nor reach the stream.
    AfterSilence(Duration),
}

/// Audio intake of one connection.
#[derive(Clone)]
pub struct VoiceReceiver {
    guild_id: GuildId,
    packets: Arc<dyn PacketSource>,
}

impl VoiceReceiver {
    pub fn new(guild_id: GuildId, packets: Arc<dyn PacketSource>) -> Self {
        Self { guild_id, packets }
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    /// Subscribes to `user_id`'s opus packets.
    ///
    /// # Errors
    ///
    /// Propagates the transport's refusal to open a feed.
    pub fn subscribe(&self, user_id: &UserId, end: EndBehavior) -> Result<OpusStream, VoiceError> {
        let feed = self.packets.subscribe(user_id)?;
        debug!(guild_id = %self.guild_id, user_id = %user_id, end = ?end, "subscribed to user audio");
        Ok(bounded(feed, end))
    }
}

impl std::fmt::Debug for VoiceReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceReceiver")
            .field("guild_id", &self.guild_id)
            .finish_non_exhaustive()
    }
}

fn bounded(feed: mpsc::Receiver<Bytes>, end: EndBehavior) -> OpusStream {
    match end {
        EndBehavior::Manual => stream::unfold(feed, |mut feed| async move {
            feed.recv().await.map(|packet| (packet, feed))
        })
        .boxed(),
        EndBehavior::AfterSilence(silence) => {
            stream::unfold((feed, None), move |(mut feed, deadline)| async move {
                loop {
                    let next = match deadline {
                        Some(deadline) => match time::timeout_at(deadline, feed.recv()).await {
                            Ok(packet) => packet,
                            Err(_) => {
                                debug!(
                                    silence_ms = silence.as_millis() as u64,
                                    "user audio ended after silence"
                                );
                                return None;
                            }
                        },
                        None => feed.recv().await,
                    }?;
                    if is_silence_frame(&next) {
                        continue;
                    }
                    return Some((next, (feed, Some(Instant::now() + silence))));
                }
            })
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn after_silence_ends_once_packets_stop() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = bounded(rx, EndBehavior::AfterSilence(Duration::from_millis(500)));

        tx.send(Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(stream.next().await, Some(Bytes::from_static(b"a")));

        // Sender stays alive: only the silence can end the stream.
        assert_eq!(stream.next().await, None);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_timer_waits_for_first_packet() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = bounded(rx, EndBehavior::AfterSilence(Duration::from_millis(100)));

        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            tx.send(Bytes::from_static(b"late")).await.unwrap();
            tx
        });

        assert_eq!(stream.next().await, Some(Bytes::from_static(b"late")));
        let _tx = sender.await.unwrap();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_frames_do_not_hold_the_stream_open() {
        let (tx, rx) = mpsc::channel(64);
        let mut stream = bounded(rx, EndBehavior::AfterSilence(Duration::from_millis(200)));

        tx.send(Bytes::from_static(&SILENCE_FRAME)).await.unwrap();
        tx.send(Bytes::from_static(b"voice")).await.unwrap();
        let keep_alive = tokio::spawn(async move {
            for _ in 0..50 {
                if tx.send(Bytes::from_static(&SILENCE_FRAME)).await.is_err() {
                    break;
                }
                time::sleep(Duration::from_millis(20)).await;
            }
            tx
        });

        let started = Instant::now();
        assert_eq!(stream.next().await, Some(Bytes::from_static(b"voice")));
        assert_eq!(stream.next().await, None);
        assert!(started.elapsed() < Duration::from_millis(300));
        drop(keep_alive);
    }

    #[tokio::test]
    async fn manual_passes_silence_frames_through() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = bounded(rx, EndBehavior::Manual);
        tx.send(Bytes::from_static(&SILENCE_FRAME)).await.unwrap();
        drop(tx);
        assert_eq!(stream.next().await, Some(Bytes::from_static(&SILENCE_FRAME)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn manual_ends_when_feed_closes() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = bounded(rx, EndBehavior::Manual);
        tx.send(Bytes::from_static(b"x")).await.unwrap();
        drop(tx);
        assert_eq!(stream.next().await, Some(Bytes::from_static(b"x")));
        assert_eq!(stream.next().await, None);
    }
}
