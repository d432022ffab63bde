//! Durable worker record and its column types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sworker_ids::{RegistrationId, WorkerId};

/// Lifecycle stage of a worker script.
///
/// Transition legality belongs to the update orchestrator; any state may be
/// written over any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallState {
    Installing,
    Installed,
    Activated,
    Redundant,
}

impl InstallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "installing" => Some(Self::Installing),
            "installed" => Some(Self::Installed),
            "activated" => Some(Self::Activated),
            "redundant" => Some(Self::Redundant),
            _ => None,
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Response headers recorded alongside a worker's content.
///
/// Names keep the casing the server sent; lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseHeaders(BTreeMap<String, String>);

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Case-insensitive header lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    pub(crate) fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw).map(Self)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResponseHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Flattens an `http` header map. Values that are not valid UTF-8 are
/// dropped; repeated headers keep the last value.
impl From<&http::HeaderMap> for ResponseHeaders {
    fn from(map: &http::HeaderMap) -> Self {
        map.iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }
}

/// Lowercase hex SHA-256 digest of a worker's script bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Digest of an in-memory buffer.
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub(crate) fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a stored row, used to address its content BLOB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowHandle(pub(crate) i64);

/// Write-once status of a record's content column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentState {
    /// No content allocated yet.
    Empty,
    /// Content allocated but no hash recorded: a population attempt never
    /// finished. The bytes must not be trusted.
    Unfinished,
    /// Content and hash both present.
    Populated,
}

/// A worker as persisted in the `workers` table.
///
/// The script bytes are not loaded with the record; `content_size` reports
/// whether a slot exists and how large it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub registration_id: RegistrationId,
    pub url: String,
    pub install_state: InstallState,
    pub headers: Option<ResponseHeaders>,
    pub content_size: Option<u64>,
    pub content_hash: Option<ContentHash>,
    /// Unix milliseconds at insert.
    pub created_at: i64,
}

impl WorkerRecord {
    /// A fresh record: installing, no headers, no content.
    pub fn new(url: impl Into<String>, registration_id: RegistrationId) -> Self {
        Self {
            id: WorkerId::new(),
            registration_id,
            url: url.into(),
            install_state: InstallState::Installing,
            headers: None,
            content_size: None,
            content_hash: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn content_state(&self) -> ContentState {
        match (&self.content_size, &self.content_hash) {
            (None, _) => ContentState::Empty,
            (Some(_), None) => ContentState::Unfinished,
            (Some(_), Some(_)) => ContentState::Populated,
        }
    }
}
