//! Joining voice channels.

use crate::connection::Connection;
use crate::error::VoiceError;
use crate::registry::ConnectionRegistry;
use crate::transport::VoiceChannel;
use parley_types::ConnectionStatus;
use std::time::Duration;
use tracing::{debug, error, info};

/// Joins `channel` and waits up to `ready_timeout` for the connection to
/// become ready. On success the connection is registered for its guild,
/// replacing any older one.
///
/// # Errors
///
/// Returns `VoiceError::ConnectionFailed` if the transport refuses the join,
/// the link drops before becoming ready, or the timeout elapses. The partially
/// joined connection is destroyed first.
pub async fn connect_to_channel(
    channel: &VoiceChannel,
    registry: &ConnectionRegistry,
    ready_timeout: Duration,
) -> Result<Connection, VoiceError> {
    let result = {
        let join_lock = registry.join_lock(&channel.guild_id);
        let _guard = join_lock.lock().await;
        join(channel, registry, ready_timeout).await
    };
    registry.prune_join_lock(&channel.guild_id);
    result
}

async fn join(
    channel: &VoiceChannel,
    registry: &ConnectionRegistry,
    ready_timeout: Duration,
) -> Result<Connection, VoiceError> {

    debug!(
        guild_id = %channel.guild_id,
        channel_id = %channel.id,
        "joining voice channel"
    );

    let link = channel
        .adapter
        .open(&channel.guild_id, &channel.id)
        .await
        .map_err(|e| {
            error!(
                guild_id = %channel.guild_id,
                channel_id = %channel.id,
                error = %e,
                "voice adapter refused to open link"
            );
            failed(channel, e.to_string())
        })?;

    let connection = Connection::new(
        channel.guild_id.clone(),
        channel.id.clone(),
        link,
        Some(registry.clone()),
    );

    if let Err(reason) = wait_until_ready(&connection, ready_timeout).await {
        // Nothing else holds the connection yet, so destroy cannot race.
        let _ = connection.destroy();
        error!(
            guild_id = %channel.guild_id,
            channel_id = %channel.id,
            reason = %reason,
            "voice connection failed"
        );
        return Err(failed(channel, reason));
    }

    registry.insert(connection.clone());
    info!(
        guild_id = %channel.guild_id,
        channel_id = %channel.id,
        connection_id = connection.id(),
        "voice connection ready"
    );
    Ok(connection)
}

async fn wait_until_ready(connection: &Connection, ready_timeout: Duration) -> Result<(), String> {
    let mut status = connection.status_changes();
    let reached = tokio::time::timeout(
        ready_timeout,
        status.wait_for(|s| !s.is_pending()),
    )
    .await
    .map_err(|_| {
        format!(
            "connection not ready after {} ms",
            ready_timeout.as_millis()
        )
    })?;

    match reached.map(|s| *s) {
        Ok(ConnectionStatus::Ready) => Ok(()),
        Ok(other) => Err(format!("link reported {:?} before becoming ready", other)),
        Err(_) => Err("link closed its status channel".to_string()),
    }
}

fn failed(channel: &VoiceChannel, reason: String) -> VoiceError {
    VoiceError::ConnectionFailed {
        guild_id: channel.guild_id.clone(),
        channel_id: channel.id.clone(),
        reason,
    }
}
