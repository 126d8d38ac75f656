//! Playable audio resources.
//!
//! An `AudioResource` pairs a source (file, URL, bytes or live stream) with the
//! stream type it is declared as. Frames are produced lazily: nothing is
//! opened or spawned until a player starts the resource.

use crate::decode;
use crate::error::VoiceError;
use crate::transport::AudioFrame;
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use parley_types::StreamType;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Frames buffered between a decoder task and its player (one second).
const FRAME_BUFFER: usize = 50;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

pub(crate) type FrameResult = Result<AudioFrame, VoiceError>;

/// Where a resource's audio comes from.
pub enum AudioSource {
    File(PathBuf),
    Url(String),
    Bytes(Bytes),
    /// A live stream. For `StreamType::Opus` every item must be exactly one
    /// opus packet; for other types items are arbitrary chunks.
    Stream(ByteStream),
}

impl AudioSource {
    /// Interprets `location` as a URL when it has an http(s) scheme and as a
    /// file path otherwise.
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Url(location.to_string())
        } else {
            Self::File(PathBuf::from(location))
        }
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }
}

impl From<&str> for AudioSource {
    fn from(location: &str) -> Self {
        Self::parse(location)
    }
}

impl From<PathBuf> for AudioSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<Bytes> for AudioSource {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A volume knob shared between a resource's handle and whatever plays it.
#[derive(Debug, Clone)]
pub struct VolumeControl(Arc<watch::Sender<f32>>);

impl VolumeControl {
    pub fn new(volume: f32) -> Self {
        let (tx, _) = watch::channel(clamp_volume(volume));
        Self(Arc::new(tx))
    }

    pub fn get(&self) -> f32 {
        *self.0.borrow()
    }

    /// Sets the linear gain. Negative and non-finite values are clamped to 0.
    pub fn set(&self, volume: f32) {
        self.0.send_replace(clamp_volume(volume));
    }

    /// Follows later volume changes.
    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.0.subscribe()
    }

    /// Scales PCM frames. Opus frames pass through untouched since they are
    /// never decoded here.
    pub(crate) fn apply(&self, frame: AudioFrame) -> AudioFrame {
        let volume = self.get();
        match frame {
            AudioFrame::Pcm(mut samples) if (volume - 1.0).abs() > f32::EPSILON => {
                for sample in &mut samples {
                    let scaled = (*sample as f32 * volume).round();
                    *sample = scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                }
                AudioFrame::Pcm(samples)
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceOptions {
    pub stream_type: StreamType,
    /// Allow the volume to be changed after creation.
    pub inline_volume: bool,
    pub ffmpeg_binary: PathBuf,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            stream_type: StreamType::Arbitrary,
            inline_volume: false,
            ffmpeg_binary: PathBuf::from("ffmpeg"),
        }
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.max(0.0)
    } else {
        0.0
    }
}

/// Inspection and control handle for a resource that may already be playing.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: u64,
    stream_type: StreamType,
    volume: Option<VolumeControl>,
}

impl ResourceHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Current volume, or `None` if the resource was built without inline volume.
    pub fn volume(&self) -> Option<f32> {
        self.volume.as_ref().map(VolumeControl::get)
    }

    /// Returns `false` if the resource has no inline volume control.
    pub fn set_volume(&self, volume: f32) -> bool {
        match &self.volume {
            Some(control) => {
                control.set(volume);
                true
            }
            None => false,
        }
    }

    /// Shared volume knob, if the resource was built with inline volume.
    pub fn volume_control(&self) -> Option<VolumeControl> {
        self.volume.clone()
    }
}

pub struct AudioResource {
    handle: ResourceHandle,
    source: AudioSource,
    ffmpeg_binary: PathBuf,
}

/// Builds a resource from `source`. Never fails: problems opening or decoding
/// the source surface when the resource is played.
pub fn create_audio_resource(source: AudioSource, options: ResourceOptions) -> AudioResource {
    let handle = ResourceHandle {
        id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
        stream_type: options.stream_type,
        volume: options.inline_volume.then(|| VolumeControl::new(1.0)),
    };
    AudioResource {
        handle,
        source,
        ffmpeg_binary: options.ffmpeg_binary,
    }
}

impl AudioResource {
    pub fn handle(&self) -> ResourceHandle {
        self.handle.clone()
    }

    pub fn stream_type(&self) -> StreamType {
        self.handle.stream_type
    }

    pub fn set_volume(&self, volume: f32) -> bool {
        self.handle.set_volume(volume)
    }

    /// Splits the resource for engines that decode sources themselves.
    pub fn into_parts(self) -> (ResourceHandle, AudioSource) {
        (self.handle, self.source)
    }

    /// Starts the decoder task. Frames (or the first decoding error) arrive on
    /// the returned channel, which closes when the source is exhausted.
    pub(crate) fn spawn(self) -> (mpsc::Receiver<FrameResult>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let AudioResource {
            handle,
            source,
            ffmpeg_binary,
        } = self;

        let task = tokio::spawn(async move {
            tracing::debug!(
                resource_id = handle.id,
                stream_type = ?handle.stream_type,
                source = ?source,
                "starting audio decoder"
            );
            if let Err(e) = decode::run(source, handle.stream_type, &ffmpeg_binary, &tx).await {
                tracing::warn!(resource_id = handle.id, error = %e, "audio source failed");
                let _ = tx.send(Err(e)).await;
            }
        });

        (rx, task)
    }
}

impl fmt::Debug for AudioResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioResource")
            .field("handle", &self.handle)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_distinguishes_urls_from_paths() {
        assert!(matches!(
            AudioSource::parse("https://example.com/a.mp3"),
            AudioSource::Url(_)
        ));
        assert!(matches!(AudioSource::parse("./clip.ogg"), AudioSource::File(_)));
    }

    #[test]
    fn volume_is_only_adjustable_with_inline_volume() {
        let plain = create_audio_resource(AudioSource::Bytes(Bytes::new()), ResourceOptions::default());
        assert_eq!(plain.handle().volume(), None);
        assert!(!plain.set_volume(0.5));

        let inline = create_audio_resource(
            AudioSource::Bytes(Bytes::new()),
            ResourceOptions {
                inline_volume: true,
                ..ResourceOptions::default()
            },
        );
        assert_eq!(inline.handle().volume(), Some(1.0));
        assert!(inline.set_volume(0.25));
        assert_eq!(inline.handle().volume(), Some(0.25));
    }

    #[test]
    fn volume_scales_pcm_and_saturates() {
        let control = VolumeControl::new(2.0);
        let scaled = control.apply(AudioFrame::Pcm(vec![100, -100, i16::MAX, i16::MIN]));
        assert_eq!(
            scaled,
            AudioFrame::Pcm(vec![200, -200, i16::MAX, i16::MIN])
        );

        let opus = AudioFrame::Opus(Bytes::from_static(&[0xfc, 0x01]));
        assert_eq!(control.apply(opus.clone()), opus);
    }

    #[tokio::test]
    async fn volume_changes_reach_subscribers() {
        let control = VolumeControl::new(1.0);
        let mut changes = control.subscribe();
        control.set(0.3);
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), 0.3);
    }

    #[test]
    fn negative_volume_clamps_to_zero() {
        let control = VolumeControl::new(1.0);
        control.set(-3.0);
        assert_eq!(control.get(), 0.0);
        control.set(f32::NAN);
        assert_eq!(control.get(), 0.0);
    }
}
