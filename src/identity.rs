//! Local and remote peer identities.
//!
//! A [`PeerId`] is the plain-text token people share to find each other. With
//! the iroh transport it is the textual form of the endpoint's `NodeId`, which
//! is derived from a secret key generated (or loaded) once at startup.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use iroh::{NodeId, SecretKey};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const CALLSIGN_ADJECTIVES: [&str; 8] = [
    "Iron", "Red", "Gold", "Black", "Silver", "Dread", "Salt", "Storm",
];
const CALLSIGN_NAMES: [&str; 10] = [
    "Gull", "Kraken", "Marlin", "Orca", "Heron", "Petrel", "Albatross", "Narwhal", "Shark", "Tern",
];

/// A shareable peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a token, trimming the whitespace that tends to come with pasting.
    pub fn new(token: impl AsRef<str>) -> Self {
        Self(token.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A memorable `Adjective-Name-NNN` label derived from the id.
    ///
    /// Stable across processes, so both ends of a link show the same name.
    pub fn callsign(&self) -> String {
        // FNV-1a
        let hash = self
            .0
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
                (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
            });
        let adjective = CALLSIGN_ADJECTIVES[(hash % CALLSIGN_ADJECTIVES.len() as u64) as usize];
        let name = CALLSIGN_NAMES[((hash >> 16) % CALLSIGN_NAMES.len() as u64) as usize];
        format!("{}-{}-{}", adjective, name, (hash >> 32) % 1000)
    }

    /// Interpret the token as an iroh node id.
    pub fn to_node_id(&self) -> Result<NodeId> {
        self.0
            .parse::<NodeId>()
            .with_context(|| format!("not a node id: {:?}", self.0))
    }
}

impl From<NodeId> for PeerId {
    fn from(node_id: NodeId) -> Self {
        Self(node_id.to_string())
    }
}

impl From<&str> for PeerId {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Load the endpoint's secret key from `path`, generating and saving one if
/// the file does not exist. Without a path the key is ephemeral.
pub fn load_or_generate_key(path: Option<&Path>) -> Result<SecretKey> {
    match path {
        Some(path) if path.exists() => {
            let key_bytes = std::fs::read(path)
                .with_context(|| format!("reading key file {}", path.display()))?;
            let key_array: [u8; 32] = key_bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("invalid key file: expected 32 bytes"))?;
            let key = SecretKey::from_bytes(&key_array);
            info!(path = %path.display(), "Loaded secret key from file");
            Ok(key)
        }
        Some(path) => {
            let key = SecretKey::generate(&mut rand::thread_rng());
            std::fs::write(path, key.to_bytes())
                .with_context(|| format!("writing key file {}", path.display()))?;
            info!(path = %path.display(), "Generated and saved new secret key");
            Ok(key)
        }
        None => {
            let key = SecretKey::generate(&mut rand::thread_rng());
            warn!("Generated ephemeral secret key (not persisted)");
            Ok(key)
        }
    }
}
