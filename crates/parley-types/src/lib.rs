//! Shared identifiers and status types for the Parley voice helpers.
//!
//! This crate holds the vocabulary that both the voice pipeline and its hosts
//! speak: guild, channel and user identifiers, player and connection statuses,
//! the declared stream types of playable audio, and the terminal reasons a
//! playback can end with.
//!
//! Nothing here performs I/O. Keeping the types in their own crate lets a host
//! application depend on them without pulling in the tokio/reqwest stack.

use serde::{Deserialize, Serialize};
use std::fmt;

mod voice;
pub use voice::{
    ConnectionStatus, NoSubscriberBehavior, PlaybackEnd, PlayerStatus, StreamType,
};

macro_rules! snowflake_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Returns the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

snowflake_id!(
    /// Identifier of a guild (server). Voice connections are keyed by it.
    GuildId
);
snowflake_id!(
    /// Identifier of a voice channel inside a guild.
    ChannelId
);
snowflake_id!(
    /// Identifier of a participant whose audio can be received.
    UserId
);

/// Number of 48 kHz samples per channel in one 20 ms frame.
pub const SAMPLES_PER_FRAME: usize = 960;

/// Sample rate used by the voice transport.
pub const SAMPLE_RATE: u32 = 48_000;

/// Channel count used by the voice transport.
pub const CHANNELS: u8 = 2;
