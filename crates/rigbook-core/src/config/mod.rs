//! Sync configuration.
//!
//! [`SyncOptions`] tunes one sync pass. [`RemoteConfig`] says where the
//! shared record store lives and is resolved from `RIGBOOK_*` environment
//! variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::sync::DEFAULT_MAX_ASSET_BYTES;
use crate::util::{is_remote_url, normalize_text_option};
use crate::{Error, Result};

pub const ENV_REMOTE_URL: &str = "RIGBOOK_REMOTE_URL";
pub const ENV_REMOTE_TOKEN: &str = "RIGBOOK_REMOTE_TOKEN";
pub const ENV_REMOTE_PATH: &str = "RIGBOOK_REMOTE_PATH";
pub const ENV_ZONE: &str = "RIGBOOK_ZONE";
pub const ENV_MAX_ASSET_BYTES: &str = "RIGBOOK_MAX_ASSET_BYTES";
pub const ENV_BATCH_LIMIT: &str = "RIGBOOK_BATCH_LIMIT";

/// Zone every replica of one garage syncs into.
pub const DEFAULT_ZONE: &str = "RigbookZone";

/// Options for a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub zone: String,
    /// Ceiling for inline photo assets
    pub max_asset_bytes: usize,
    /// Records per remote call, when lower than the store's own limit
    pub batch_limit: Option<usize>,
    /// Push every live entity, not just pending ones
    pub force_full_push: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            zone: DEFAULT_ZONE.to_string(),
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
            batch_limit: None,
            force_full_push: false,
        }
    }
}

impl SyncOptions {
    /// Defaults overridden by `RIGBOOK_ZONE`, `RIGBOOK_MAX_ASSET_BYTES` and
    /// `RIGBOOK_BATCH_LIMIT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(zone) = normalize_text_option(lookup(ENV_ZONE)) {
            options.zone = zone;
        }
        if let Some(bytes) = parse_positive(&lookup, ENV_MAX_ASSET_BYTES)? {
            options.max_asset_bytes = bytes;
        }
        options.batch_limit = parse_positive(&lookup, ENV_BATCH_LIMIT)?;
        Ok(options)
    }

    #[must_use]
    pub const fn with_full_push(mut self, force: bool) -> Self {
        self.force_full_push = force;
        self
    }
}

/// Where the shared record store lives.
#[derive(Clone, PartialEq, Eq)]
pub enum RemoteConfig {
    /// Hosted libSQL/Turso database
    Hosted { url: String, token: String },
    /// Database file reachable by every device (e.g. a synced folder)
    File { path: PathBuf },
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hosted { url, .. } => formatter
                .debug_struct("Hosted")
                .field("url", url)
                .field("token", &"[REDACTED]")
                .finish(),
            Self::File { path } => formatter.debug_struct("File").field("path", path).finish(),
        }
    }
}

impl RemoteConfig {
    /// Resolve from the process environment; `None` when sync is not
    /// configured at all.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| std::env::var(key).ok())
    }
}

/// Resolve a [`RemoteConfig`] from a variable lookup.
///
/// A URL needs a token; a URL and a path together are ambiguous.
pub fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<RemoteConfig>> {
    let url = normalize_text_option(lookup(ENV_REMOTE_URL));
    let token = normalize_text_option(lookup(ENV_REMOTE_TOKEN));
    let path = normalize_text_option(lookup(ENV_REMOTE_PATH));

    match (url, token, path) {
        (None, None, None) => Ok(None),
        (Some(_), _, Some(_)) => Err(Error::InvalidInput(format!(
            "Remote configuration is ambiguous. Set either {ENV_REMOTE_URL} or {ENV_REMOTE_PATH}, not both"
        ))),
        (None, None, Some(path)) => Ok(Some(RemoteConfig::File {
            path: PathBuf::from(path),
        })),
        (Some(url), Some(token), None) => {
            if !is_remote_url(&url) {
                return Err(Error::InvalidInput(format!(
                    "{ENV_REMOTE_URL} must start with libsql://, https:// or http://"
                )));
            }
            Ok(Some(RemoteConfig::Hosted { url, token }))
        }
        (Some(_), None, None) => Err(Error::InvalidInput(format!(
            "Remote configuration is incomplete. Missing: {ENV_REMOTE_TOKEN}"
        ))),
        (None, Some(_), _) => Err(Error::InvalidInput(format!(
            "Remote configuration is incomplete. Missing: {ENV_REMOTE_URL}"
        ))),
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<usize>> {
    let Some(value) = normalize_text_option(lookup(key)) else {
        return Ok(None);
    };
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(Some(parsed)),
        _ => Err(Error::InvalidInput(format!(
            "{key} must be a positive integer, got {value:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse_from_map(map: &HashMap<&str, &str>) -> Result<Option<RemoteConfig>> {
        parse_config(|key| map.get(key).map(|value| (*value).to_string()))
    }

    fn options_from_map(map: &HashMap<&str, &str>) -> Result<SyncOptions> {
        SyncOptions::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn parse_config_none_returns_none() {
        assert!(parse_from_map(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn parse_config_accepts_hosted_remote() {
        let mut map = HashMap::new();
        map.insert(ENV_REMOTE_URL, " libsql://rigs.turso.io ");
        map.insert(ENV_REMOTE_TOKEN, "secret");

        let config = parse_from_map(&map).unwrap().unwrap();
        assert_eq!(
            config,
            RemoteConfig::Hosted {
                url: "libsql://rigs.turso.io".to_string(),
                token: "secret".to_string(),
            }
        );
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn parse_config_accepts_shared_file() {
        let mut map = HashMap::new();
        map.insert(ENV_REMOTE_PATH, "/mnt/shared/rigbook-remote.db");

        assert_eq!(
            parse_from_map(&map).unwrap(),
            Some(RemoteConfig::File {
                path: PathBuf::from("/mnt/shared/rigbook-remote.db"),
            })
        );
    }

    #[test]
    fn parse_config_requires_token_with_url() {
        let mut map = HashMap::new();
        map.insert(ENV_REMOTE_URL, "libsql://rigs.turso.io");

        match parse_from_map(&map).unwrap_err() {
            Error::InvalidInput(message) => assert!(message.contains(ENV_REMOTE_TOKEN)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_config_rejects_url_and_path_together() {
        let mut map = HashMap::new();
        map.insert(ENV_REMOTE_URL, "libsql://rigs.turso.io");
        map.insert(ENV_REMOTE_TOKEN, "secret");
        map.insert(ENV_REMOTE_PATH, "/tmp/remote.db");

        assert!(matches!(
            parse_from_map(&map),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn parse_config_rejects_non_remote_scheme() {
        let mut map = HashMap::new();
        map.insert(ENV_REMOTE_URL, "ftp://rigs.example.com");
        map.insert(ENV_REMOTE_TOKEN, "secret");

        match parse_from_map(&map).unwrap_err() {
            Error::InvalidInput(message) => assert!(message.contains(ENV_REMOTE_URL)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn sync_options_defaults_and_overrides() {
        assert_eq!(options_from_map(&HashMap::new()).unwrap(), SyncOptions::default());

        let mut map = HashMap::new();
        map.insert(ENV_ZONE, "fleet");
        map.insert(ENV_MAX_ASSET_BYTES, "512000");
        map.insert(ENV_BATCH_LIMIT, "50");
        let options = options_from_map(&map).unwrap();

        assert_eq!(options.zone, "fleet");
        assert_eq!(options.max_asset_bytes, 512_000);
        assert_eq!(options.batch_limit, Some(50));
        assert!(!options.force_full_push);
    }

    #[test]
    fn sync_options_reject_zero_and_garbage() {
        let mut map = HashMap::new();
        map.insert(ENV_BATCH_LIMIT, "0");
        assert!(options_from_map(&map).is_err());

        map.insert(ENV_BATCH_LIMIT, "lots");
        assert!(options_from_map(&map).is_err());
    }
}
