#![allow(dead_code)]

use bytes::Bytes;
use parley_voice::{LoopbackAdapter, VoiceChannel, VoiceConfig};
use std::sync::Arc;
use std::time::Duration;

/// CELT fullband 20 ms, one frame, carrying (fake) voice.
pub const OPUS_PACKET: [u8; 3] = [0xf8, 0x01, 0x02];

pub fn opus_packet(marker: u8) -> Bytes {
    Bytes::from(vec![0xf8, 0x01, marker])
}

pub fn silence_packet() -> Bytes {
    Bytes::from_static(&parley_voice::SILENCE_FRAME)
}

/// Short ticks so playback tests finish quickly.
pub fn fast_config() -> VoiceConfig {
    VoiceConfig {
        ready_timeout_ms: 1_000,
        frame_duration_ms: 5,
        missed_frame_tolerance_ms: 200,
        ..VoiceConfig::default()
    }
}

pub fn loopback_channel(guild: &str, channel: &str) -> (VoiceChannel, LoopbackAdapter) {
    let adapter = LoopbackAdapter::new(Duration::from_millis(5));
    let channel = VoiceChannel::new(channel, guild, Arc::new(adapter.clone()));
    (channel, adapter)
}

/// `frames` frames of s16le stereo PCM where every sample is `value`.
pub fn raw_pcm(frames: usize, value: i16) -> Bytes {
    let samples = frames * parley_types::SAMPLES_PER_FRAME * parley_types::CHANNELS as usize;
    let mut pcm = Vec::with_capacity(samples * 2);
    for _ in 0..samples {
        pcm.extend_from_slice(&value.to_le_bytes());
    }
    Bytes::from(pcm)
}
