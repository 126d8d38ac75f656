//! Parley host binary.
//!
//! Loads configuration, installs structured logging and runs a smoke
//! playback through the in-memory loopback transport: it joins a loopback
//! channel, plays the configured clip (or a generated tone) and reports the
//! player transitions it observed before leaving.

mod config;

use parley_types::{PlayerStatus, StreamType, CHANNELS, SAMPLES_PER_FRAME, SAMPLE_RATE};
use parley_voice::{
    AudioSource, LoopbackAdapter, PlayOptions, VoiceChannel, VoiceError, VoiceToolkit,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("parley.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, parley-host cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let toolkit = VoiceToolkit::new(config.voice.clone())
        .expect("voice configuration was validated at load time");

    tokio::select! {
        result = smoke_run(&toolkit, &config.smoke) => match result {
            Ok(()) => tracing::info!("smoke run finished"),
            Err(e) => {
                tracing::error!(error = %e, "smoke run failed");
                std::process::exit(1);
            }
        },
        () = shutdown_signal() => {
            let guild = config.smoke.guild_id.as_str().into();
            if let Err(e) = toolkit.disconnect(&guild) {
                tracing::warn!(error = %e, "disconnect on shutdown failed");
            }
        }
    }

    tracing::info!("parley host shut down");
}

async fn smoke_run(toolkit: &VoiceToolkit, smoke: &config::SmokeConfig) -> Result<(), VoiceError> {
    let adapter = LoopbackAdapter::new(Duration::from_millis(smoke.ready_delay_ms));
    let channel = VoiceChannel::new(
        smoke.channel_id.as_str(),
        smoke.guild_id.as_str(),
        Arc::new(adapter.clone()),
    );

    let (source, stream_type) = match &smoke.clip {
        Some(clip) => (AudioSource::parse(clip), smoke.stream_type),
        None => (AudioSource::Bytes(tone(440.0, Duration::from_secs(1)).into()), StreamType::Raw),
    };
    tracing::info!(
        guild_id = %smoke.guild_id,
        channel_id = %smoke.channel_id,
        source = ?source,
        "starting smoke playback"
    );

    let mut session = toolkit
        .play(
            source,
            &channel,
            PlayOptions {
                stream_type: Some(stream_type),
                ..PlayOptions::default()
            },
        )
        .await?;

    let mut transitions = Vec::new();
    while let Ok(change) = session.events.recv().await {
        transitions.push(change.new.label());
        if change.new == PlayerStatus::Idle {
            break;
        }
    }
    let end = session.teardown.await?;

    let frames = adapter
        .last_link()
        .map(|link| link.audio_frame_count())
        .unwrap_or_default();
    tracing::info!(
        end = ?end,
        frames,
        transitions = %transitions.join(" -> "),
        disconnected = session.connection.is_destroyed(),
        "smoke playback complete"
    );
    Ok(())
}

/// A sine tone as s16le stereo PCM at the transport's sample rate, padded to
/// whole frames.
fn tone(frequency: f32, duration: Duration) -> Vec<u8> {
    let frames = (duration.as_millis() as usize / 20).max(1);
    let total = frames * SAMPLES_PER_FRAME;
    let mut pcm = Vec::with_capacity(total * CHANNELS as usize * 2);
    for n in 0..total {
        let t = n as f32 / SAMPLE_RATE as f32;
        let sample = ((t * frequency * std::f32::consts::TAU).sin() * 8_000.0) as i16;
        for _ in 0..CHANNELS {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
    }
    pcm
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
