use std::{io, path::PathBuf};

use crate::settings::Destination;

/// Errors surfaced by the proxy core and its configuration layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listening socket could not be bound; fatal to `start()`.
    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] io::Error),

    /// The destination could not be reached for one client connection.
    #[error("failed to connect to {destination}: {source}")]
    Connect {
        destination: Destination,
        #[source]
        source: io::Error,
    },

    /// A read or write failed mid-stream on one connection.
    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),

    /// The server was asked to start without a configured destination.
    #[error("no destination configured")]
    NoDestination,

    /// A destination string could not be parsed as host[:port].
    #[error("invalid destination {0:?}")]
    InvalidDestination(String),

    #[error("failed to read settings from {}", .path.display())]
    SettingsRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse settings from {}", .path.display())]
    SettingsParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write settings to {}", .path.display())]
    SettingsWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    SettingsEncode(#[from] toml::ser::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
