//! Turns audio sources into transport frames.
//!
//! `Opus` streams are forwarded packet by packet, `OggOpus` is demuxed with the
//! `ogg` crate, `Raw` PCM is sliced into 20 ms frames, and everything else goes
//! through an `ffmpeg` child process that emits raw PCM.

use crate::error::VoiceError;
use crate::resource::{AudioSource, FrameResult};
use crate::transport::AudioFrame;
use bytes::Bytes;
use futures_util::StreamExt;
use parley_types::{StreamType, CHANNELS, SAMPLES_PER_FRAME, SAMPLE_RATE};
use std::io::{self, Cursor};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// Bytes in one 20 ms frame of s16le stereo PCM.
pub(crate) const PCM_FRAME_BYTES: usize = SAMPLES_PER_FRAME * CHANNELS as usize * 2;

/// Upper bound on an Ogg Opus input buffered for demuxing (64 MiB).
pub(crate) const MAX_OGG_INPUT_BYTES: u64 = 64 * 1024 * 1024;

/// ffmpeg diagnostics kept for the error message. The rest is drained.
const MAX_STDERR_BYTES: usize = 8 * 1024;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

pub(crate) async fn run(
    source: AudioSource,
    stream_type: StreamType,
    ffmpeg_binary: &Path,
    tx: &mpsc::Sender<FrameResult>,
) -> Result<(), VoiceError> {
    match stream_type {
        StreamType::Opus => forward_opus(source, tx).await,
        StreamType::OggOpus => {
            demux_ogg(open_reader(source).await?, MAX_OGG_INPUT_BYTES, tx).await
        }
        StreamType::Raw => slice_pcm(open_reader(source).await?, tx).await,
        StreamType::Arbitrary => transcode(source, ffmpeg_binary, tx).await,
    }
}

pub(crate) async fn open_reader(source: AudioSource) -> Result<BoxedReader, VoiceError> {
    let reader: BoxedReader = match source {
        AudioSource::File(path) => Box::new(tokio::fs::File::open(&path).await.map_err(|e| {
            VoiceError::Source(format!("failed to open {}: {}", path.display(), e))
        })?),
        AudioSource::Bytes(bytes) => Box::new(Cursor::new(bytes)),
        AudioSource::Stream(stream) => Box::new(StreamReader::new(stream)),
        AudioSource::Url(url) => {
            let response = reqwest::get(&url).await?.error_for_status()?;
            let body = response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other));
            Box::new(StreamReader::new(body.boxed()))
        }
    };
    Ok(reader)
}

async fn forward_opus(
    source: AudioSource,
    tx: &mpsc::Sender<FrameResult>,
) -> Result<(), VoiceError> {
    let AudioSource::Stream(mut packets) = source else {
        return Err(VoiceError::Source(
            "opus input must be a stream of packets".to_string(),
        ));
    };

    while let Some(packet) = packets.next().await {
        let packet = packet.map_err(|e| VoiceError::Source(e.to_string()))?;
        if packet.is_empty() {
            continue;
        }
        if tx.send(Ok(AudioFrame::Opus(packet))).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Demuxes an Ogg Opus bitstream. The `ogg` reader needs `Seek`, so the whole
/// input (up to `limit` bytes) is buffered before the first packet is emitted.
async fn demux_ogg(
    reader: BoxedReader,
    limit: u64,
    tx: &mpsc::Sender<FrameResult>,
) -> Result<(), VoiceError> {
    let mut data = Vec::new();
    reader
        .take(limit + 1)
        .read_to_end(&mut data)
        .await
        .map_err(|e| VoiceError::Source(format!("failed to read ogg input: {}", e)))?;
    if data.len() as u64 > limit {
        return Err(VoiceError::Source(format!(
            "ogg input exceeds maximum size of {} bytes",
            limit
        )));
    }

    let tx = tx.clone();
    tokio::task::spawn_blocking(move || {
        let mut packets = ogg::PacketReader::new(Cursor::new(data));
        loop {
            let packet = match packets.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => return Ok(()),
                Err(e) => return Err(VoiceError::Source(format!("invalid ogg stream: {}", e))),
            };
            if packet.data.starts_with(b"OpusHead") || packet.data.starts_with(b"OpusTags") {
                continue;
            }
            if tx
                .blocking_send(Ok(AudioFrame::Opus(Bytes::from(packet.data))))
                .is_err()
            {
                return Ok(());
            }
        }
    })
    .await
    .map_err(|e| VoiceError::Source(format!("ogg demuxer panicked: {}", e)))?
}

async fn slice_pcm<R>(mut reader: R, tx: &mpsc::Sender<FrameResult>) -> Result<(), VoiceError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buf = vec![0u8; PCM_FRAME_BYTES];
        let filled = read_full(&mut reader, &mut buf).await?;
        if filled == 0 {
            return Ok(());
        }
        // A short final read keeps its zero padding.
        let samples = buf
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if tx.send(Ok(AudioFrame::Pcm(samples))).await.is_err() {
            return Ok(());
        }
        if filled < PCM_FRAME_BYTES {
            return Ok(());
        }
    }
}

pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, VoiceError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| VoiceError::Source(e.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn transcode(
    source: AudioSource,
    ffmpeg_binary: &Path,
    tx: &mpsc::Sender<FrameResult>,
) -> Result<(), VoiceError> {
    let mut command = Command::new(ffmpeg_binary);
    command
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-analyzeduration")
        .arg("0");

    let feed = match source {
        AudioSource::File(path) => {
            command.arg("-i").arg(path);
            None
        }
        AudioSource::Url(url) => {
            command.arg("-i").arg(url);
            None
        }
        other => {
            command.arg("-i").arg("pipe:0");
            Some(other)
        }
    };

    command
        .arg("-f")
        .arg("s16le")
        .arg("-ar")
        .arg(SAMPLE_RATE.to_string())
        .arg("-ac")
        .arg(CHANNELS.to_string())
        .arg("pipe:1")
        .stdin(if feed.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| VoiceError::Source(format!("Failed to spawn ffmpeg: {}", e)))?;

    if let Some(feed) = feed {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Source("Failed to open ffmpeg stdin".to_string()))?;
        let mut input = open_reader(feed).await?;
        // Feed from a separate task so a full stdout pipe cannot deadlock us.
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut input, &mut stdin).await {
                tracing::debug!(error = %e, "ffmpeg input closed early");
            }
            let _ = stdin.shutdown().await;
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| VoiceError::Source("Failed to open ffmpeg stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| VoiceError::Source("Failed to open ffmpeg stderr".to_string()))?;
    // Drain stderr separately so a chatty ffmpeg cannot stall on a full pipe.
    let diagnostics = tokio::spawn(drain_capped(stderr, MAX_STDERR_BYTES));

    slice_pcm(stdout, tx).await?;

    if tx.is_closed() {
        // Player went away; `kill_on_drop` reaps the child.
        return Ok(());
    }

    let status = child
        .wait()
        .await
        .map_err(|e| VoiceError::Source(format!("Failed to wait for ffmpeg: {}", e)))?;
    if !status.success() {
        let stderr = diagnostics.await.unwrap_or_default();
        let stderr = String::from_utf8_lossy(&stderr);
        return Err(VoiceError::Source(format!("ffmpeg failed: {}", stderr.trim())));
    }
    Ok(())
}

/// Reads `reader` to the end, keeping at most `cap` bytes.
async fn drain_capped<R>(mut reader: R, cap: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return kept,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn raw_pcm_is_sliced_into_padded_frames() {
        let mut pcm = vec![0u8; PCM_FRAME_BYTES + 4];
        pcm[0] = 0x01;
        pcm[PCM_FRAME_BYTES] = 0x02;
        let (tx, mut rx) = mpsc::channel(8);

        run(
            AudioSource::Bytes(Bytes::from(pcm)),
            StreamType::Raw,
            Path::new("ffmpeg"),
            &tx,
        )
        .await
        .unwrap();
        drop(tx);

        let Some(Ok(AudioFrame::Pcm(first))) = rx.recv().await else {
            panic!("expected a pcm frame");
        };
        assert_eq!(first.len(), SAMPLES_PER_FRAME * 2);
        assert_eq!(first[0], 1);

        let Some(Ok(AudioFrame::Pcm(second))) = rx.recv().await else {
            panic!("expected a padded pcm frame");
        };
        assert_eq!(second[0], 2);
        assert!(second[2..].iter().all(|s| *s == 0));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn opus_packets_are_forwarded_and_empty_ones_skipped() {
        let packets = stream::iter(vec![
            Ok(Bytes::from_static(&[0xf8, 0x01])),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(&[0xf8, 0x02])),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        run(
            AudioSource::stream(packets),
            StreamType::Opus,
            Path::new("ffmpeg"),
            &tx,
        )
        .await
        .unwrap();
        drop(tx);

        let mut received = Vec::new();
        while let Some(frame) = rx.recv().await {
            received.push(frame.unwrap());
        }
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn opus_from_a_file_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let err = run(
            AudioSource::parse("clip.opus"),
            StreamType::Opus,
            Path::new("ffmpeg"),
            &tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VoiceError::Source(_)));
    }

    #[tokio::test]
    async fn oversized_ogg_input_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let input: BoxedReader = Box::new(Cursor::new(vec![0u8; 2048]));
        let err = demux_ogg(input, 1024, &tx).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum size"));
    }

    #[tokio::test]
    async fn stderr_drain_reads_everything_but_keeps_the_cap() {
        let noisy = Cursor::new(vec![b'x'; 20_000]);
        let kept = drain_capped(noisy, 100).await;
        assert_eq!(kept.len(), 100);
    }

    #[tokio::test]
    async fn missing_file_reports_source_error() {
        let (tx, _rx) = mpsc::channel(1);
        let err = run(
            AudioSource::parse("/definitely/not/here.ogg"),
            StreamType::OggOpus,
            Path::new("ffmpeg"),
            &tx,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed to open"));
    }
}
