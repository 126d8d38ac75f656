//! Recording a participant to an Ogg Opus file.
//!
//! An async task pulls the participant's packets and forwards them to a
//! blocking writer that owns the file. The writer only keeps the file if it
//! sees an explicit finish message; any error (or the producer going away)
//! closes the handle and removes the partial file.

use crate::completion::Completion;
use crate::config::RecordingConfig;
use crate::error::{PipelineStage, VoiceError};
use crate::ogg_writer::OggOpusWriter;
use crate::receiver::{EndBehavior, VoiceReceiver};
use bytes::Bytes;
use futures_util::StreamExt;
use parley_types::UserId;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const WRITER_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOptions {
    /// Silence after which the recording ends.
    pub silence_timeout: Duration,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_millis(1000),
        }
    }
}

enum WriterMsg {
    Packet(Bytes),
    Finish,
}

/// Records `user_id` into `filename` until they have been silent for
/// `options.silence_timeout`.
///
/// The returned completion resolves with `filename` exactly as given. It fails
/// with `VoiceError::Pipeline` naming the stage (subscribe, container or
/// filesystem) that broke; the partial file is removed in that case.
pub fn record_to_file(
    receiver: &VoiceReceiver,
    user_id: &UserId,
    filename: impl AsRef<Path>,
    options: RecordOptions,
    config: &RecordingConfig,
) -> Completion<PathBuf> {
    let path = filename.as_ref().to_path_buf();
    let config = config.clone();
    let guild_id = receiver.guild_id().clone();
    let user_id = user_id.clone();
    // Subscribe before spawning so no packet spoken in between is lost.
    let packets = receiver.subscribe(&user_id, EndBehavior::AfterSilence(options.silence_timeout));

    Completion::spawn(async move {
        let mut packets = packets.map_err(|e| {
            error!(guild_id = %guild_id, user_id = %user_id, error = %e, "recording subscription failed");
            VoiceError::pipeline(PipelineStage::Subscribe, e)
        })?;

        info!(
            guild_id = %guild_id,
            user_id = %user_id,
            path = %path.display(),
            silence_timeout_ms = options.silence_timeout.as_millis() as u64,
            "recording started"
        );

        let (tx, rx) = mpsc::channel(WRITER_QUEUE);
        let writer_path = path.clone();
        let writer = tokio::task::spawn_blocking(move || write_file(&writer_path, &config, rx));

        // A closed queue means the writer failed; its result carries the reason.
        loop {
            tokio::select! {
                packet = packets.next() => match packet {
                    Some(packet) => {
                        if tx.send(WriterMsg::Packet(packet)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                () = tx.closed() => break,
            }
        }
        let _ = tx.send(WriterMsg::Finish).await;
        drop(tx);

        match writer.await {
            Ok(Ok(count)) => {
                info!(
                    guild_id = %guild_id,
                    user_id = %user_id,
                    path = %path.display(),
                    packets = count,
                    "recording finished"
                );
                Ok(path)
            }
            Ok(Err(e)) => {
                error!(
                    guild_id = %guild_id,
                    user_id = %user_id,
                    path = %path.display(),
                    stage = ?e.pipeline_stage(),
                    error = %e,
                    "recording failed"
                );
                Err(e)
            }
            Err(e) => Err(VoiceError::Task(e.to_string())),
        }
    })
}

fn write_file(
    path: &Path,
    config: &RecordingConfig,
    rx: mpsc::Receiver<WriterMsg>,
) -> Result<u64, VoiceError> {
    let file =
        File::create(path).map_err(|e| VoiceError::pipeline(PipelineStage::Filesystem, e))?;
    let result = write_stream(file, config, rx);
    if result.is_err() {
        // The handle was dropped inside write_stream.
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove partial recording");
        }
    }
    result
}

fn write_stream(
    file: File,
    config: &RecordingConfig,
    mut rx: mpsc::Receiver<WriterMsg>,
) -> Result<u64, VoiceError> {
    let mut writer = OggOpusWriter::new(BufWriter::new(file), config).map_err(classify)?;
    loop {
        match rx.blocking_recv() {
            Some(WriterMsg::Packet(packet)) => writer.write_packet(&packet).map_err(classify)?,
            Some(WriterMsg::Finish) => {
                let count = writer.packets_written();
                let file = writer
                    .finish()
                    .map_err(classify)?
                    .into_inner()
                    .map_err(|e| VoiceError::pipeline(PipelineStage::Filesystem, e.into_error()))?;
                file.sync_all()
                    .map_err(|e| VoiceError::pipeline(PipelineStage::Filesystem, e))?;
                return Ok(count);
            }
            None => return Err(VoiceError::Cancelled),
        }
    }
}

/// Malformed packets are container errors; everything else is the file.
fn classify(e: io::Error) -> VoiceError {
    let stage = if e.kind() == io::ErrorKind::InvalidData {
        PipelineStage::Container
    } else {
        PipelineStage::Filesystem
    };
    VoiceError::pipeline(stage, e)
}
