//! Immutable proxy settings and their on-disk store.
//!
//! A [`Settings`] value is a snapshot handed to the server at start time;
//! reconfiguring a running proxy means stopping it and starting again
//! with a fresh snapshot.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Port the proxy listens on when none is configured.
pub const DEFAULT_LISTEN_PORT: u16 = 7569;

/// Simulated bandwidth in bytes per second when none is configured,
/// roughly a mid-nineties modem.
pub const DEFAULT_BYTES_PER_SECOND: u64 = 3225;

/// The upstream host and port every accepted connection is forwarded to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Destination {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Destination {
    type Err = Error;

    /// Accepts `host`, `host:port`, or an `http(s)://` URL. The port
    /// defaults to 80 when unspecified; the scheme and path are dropped,
    /// since the proxy relays raw bytes either way.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let without_scheme = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("https://"))
            .unwrap_or(trimmed);
        let authority = without_scheme
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default();

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::InvalidDestination(s.to_owned()))?;
                (host, port)
            }
            None => (authority, 80),
        };

        if host.is_empty() {
            return Err(Error::InvalidDestination(s.to_owned()));
        }

        Ok(Destination::new(host, port))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl TryFrom<String> for Destination {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Destination> for String {
    fn from(destination: Destination) -> String {
        destination.to_string()
    }
}

/// Immutable snapshot of everything the server needs to run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Local TCP port to listen on. Port 0 asks the OS for an ephemeral
    /// port; the bound address is returned by `ProxyServer::start`.
    pub listen_port: u16,

    /// Where to forward every accepted connection. Required to start.
    pub destination: Option<Destination>,

    /// Sustained throughput ceiling in bytes per second, shared across
    /// all concurrent connections. `0` disables throttling.
    pub bytes_per_second: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen_port: DEFAULT_LISTEN_PORT,
            destination: None,
            bytes_per_second: DEFAULT_BYTES_PER_SECOND,
        }
    }
}

/// Loads and saves [`Settings`] as a TOML file.
///
/// A missing file is not an error: `load` falls back to the factory
/// defaults so a fresh install starts without ceremony.
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SettingsStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Settings> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Settings::default());
            }
            Err(source) => {
                return Err(Error::SettingsRead {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        toml::from_str(&text).map_err(|source| Error::SettingsParse {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        let text = toml::to_string_pretty(settings)?;
        fs::write(&self.path, text).map_err(|source| Error::SettingsWrite {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_defaults_to_port_80() {
        let destination: Destination = "example.com".parse().unwrap();
        assert_eq!(destination.host(), "example.com");
        assert_eq!(destination.port(), 80);
    }

    #[test]
    fn explicit_port_is_kept() {
        let destination: Destination = "example.com:8080".parse().unwrap();
        assert_eq!(destination.port(), 8080);
    }

    #[test]
    fn url_forms_are_accepted() {
        let destination: Destination = "http://example.com/some/path".parse().unwrap();
        assert_eq!((destination.host(), destination.port()), ("example.com", 80));

        let destination: Destination = "https://example.com:8443/".parse().unwrap();
        assert_eq!(
            (destination.host(), destination.port()),
            ("example.com", 8443)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("".parse::<Destination>().is_err());
        assert!("http://".parse::<Destination>().is_err());
        assert!("example.com:notaport".parse::<Destination>().is_err());
    }

    #[test]
    fn displays_as_host_colon_port() {
        let destination = Destination::new("localhost", 7569);
        assert_eq!(destination.to_string(), "localhost:7569");
    }

    #[test]
    fn factory_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.listen_port, 7569);
        assert_eq!(settings.bytes_per_second, 3225);
        assert_eq!(settings.destination, None);
    }

    #[test]
    fn missing_file_loads_factory_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("missing.toml"));
        assert_eq!(store.load().unwrap(), Settings::default());
    }

    #[test]
    fn store_round_trips_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("dialup.toml"));
        let settings = Settings {
            listen_port: 9000,
            destination: Some(Destination::new("upstream.test", 8080)),
            bytes_per_second: 7000,
        };
        store.save(&settings).unwrap();
        assert_eq!(store.load().unwrap(), settings);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "bytes_per_second = 512\n").unwrap();

        let settings = SettingsStore::new(&path).load().unwrap();
        assert_eq!(settings.bytes_per_second, 512);
        assert_eq!(settings.listen_port, DEFAULT_LISTEN_PORT);
    }

    #[test]
    fn malformed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "listen_port = \"not a number\"").unwrap();
        assert!(SettingsStore::new(&path).load().is_err());
    }
}
